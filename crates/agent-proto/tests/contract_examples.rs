//! Wire-contract round-trip tests.
//!
//! Each case feeds a literal JSON frame through parse → serialize and checks
//! field-set equality against the original (field order is irrelevant,
//! absent optional fields stay absent).

use agent_proto::{Command, CommandBody, DoneStatus, SyncStatus};

/// Parse `json_text`, serialize it back, and assert value equality.
fn round_trip(json_text: &str) -> Command {
    let command = agent_proto::parse(json_text)
        .unwrap_or_else(|| panic!("failed to parse frame: {json_text}"));

    let serialized = command.to_json().expect("serialize");
    let original: serde_json::Value = serde_json::from_str(json_text).unwrap();
    let roundtripped: serde_json::Value = serde_json::from_str(&serialized).unwrap();
    assert_eq!(original, roundtripped, "round-trip mismatch for {json_text}");

    command
}

#[test]
fn register_round_trip() {
    let cmd = round_trip(
        r#"{"cmd":"register","msgid":1,"ver":"1.0.0","tz":"UTC","vendor":"acme",
            "prev_sid":"sid-1","reg_token":"tok","media_protocols":["rtmps"]}"#,
    );
    match cmd.body {
        CommandBody::Register(r) => {
            assert_eq!(r.ver, "1.0.0");
            assert_eq!(r.prev_sid.as_deref(), Some("sid-1"));
            assert_eq!(r.media_protocols, vec!["rtmps"]);
        }
        other => panic!("expected register, got {other:?}"),
    }
}

#[test]
fn hello_round_trip_prefers_upload_uri() {
    let cmd = round_trip(
        r#"{"cmd":"hello","msgid":2,"ca":"ca-pem","sid":"s1",
            "upload_url":"http://old","upload_uri":"https://new",
            "media_server":"rtmp://m","connid":"c1"}"#,
    );
    match cmd.body {
        CommandBody::Hello(h) => {
            assert_eq!(h.upload_uri.as_deref(), Some("https://new"));
            assert_eq!(h.upload_url.as_deref(), Some("http://old"));
        }
        other => panic!("expected hello, got {other:?}"),
    }
}

#[test]
fn cam_hello_carries_cam_id_in_envelope() {
    let cmd = round_trip(
        r#"{"cmd":"cam_hello","msgid":3,"cam_id":991,"media_uri":"rtmp://m/x",
            "path":"/cam/991","activity":true}"#,
    );
    assert_eq!(cmd.cam_id, Some(991));
    match cmd.body {
        CommandBody::CamHello(h) => assert!(h.activity),
        other => panic!("expected cam_hello, got {other:?}"),
    }
}

#[test]
fn bye_reason_and_unknown_reason() {
    let cmd = round_trip(r#"{"cmd":"bye","msgid":4,"reason":"auth_failure","retry":3000}"#);
    match cmd.body {
        CommandBody::Bye(b) => {
            assert_eq!(b.reason, Some(agent_proto::ByeReason::AuthFailure));
            assert_eq!(b.retry, Some(3000));
        }
        other => panic!("expected bye, got {other:?}"),
    }

    // An unrecognized reason string degrades to Invalid instead of failing.
    let cmd = agent_proto::parse(r#"{"cmd":"bye","msgid":5,"reason":"solar_flare"}"#).unwrap();
    match cmd.body {
        CommandBody::Bye(b) => assert_eq!(b.reason, Some(agent_proto::ByeReason::Invalid)),
        other => panic!("expected bye, got {other:?}"),
    }
}

#[test]
fn stream_start_round_trip() {
    let cmd = round_trip(
        r#"{"cmd":"stream_start","msgid":6,"stream_id":"Main","publish_session_id":12,
            "reason":"record_by_event"}"#,
    );
    match cmd.body {
        CommandBody::StreamStart(s) => {
            assert_eq!(s.reason, Some(agent_proto::StreamReason::RecordByEvent));
        }
        other => panic!("expected stream_start, got {other:?}"),
    }
}

#[test]
fn cam_event_round_trip_with_meta() {
    let cmd = round_trip(
        r#"{"cmd":"cam_event","msgid":7,"cam_id":1,"event":"motion","time":1767000000.25,
            "active":true,"meta":{"region":2},"status":"ok"}"#,
    );
    match cmd.body {
        CommandBody::CamEvent(e) => {
            assert_eq!(e.event.name(), "motion");
            assert_eq!(e.event.active, Some(true));
            assert_eq!(e.event.meta.unwrap()["region"], 2);
        }
        other => panic!("expected cam_event, got {other:?}"),
    }
}

#[test]
fn custom_event_round_trip() {
    let cmd = round_trip(
        r#"{"cmd":"cam_event","msgid":8,"event":"custom","custom_event_name":"qos-report",
            "time":1767000001.0}"#,
    );
    match cmd.body {
        CommandBody::CamEvent(e) => assert_eq!(e.event.name(), "qos-report"),
        other => panic!("expected cam_event, got {other:?}"),
    }
}

#[test]
fn direct_upload_url_with_extra_entries() {
    let cmd = round_trip(
        r#"{"cmd":"direct_upload_url","msgid":9,"refid":5,"status":"OK",
            "url":"https://storage/put/1","headers":{"x-amz-acl":"private"},
            "category":"snapshot",
            "extra":[{"status":"OK","url":"https://storage/put/2",
                      "headers":{},"category":"file_meta"}]}"#,
    );
    assert_eq!(cmd.refid, Some(5));
    match cmd.body {
        CommandBody::DirectUploadUrl(d) => {
            assert_eq!(d.status, "OK");
            assert_eq!(d.headers["x-amz-acl"], "private");
            assert_eq!(d.extra.len(), 1);
            assert_eq!(
                d.extra[0].category,
                Some(agent_proto::UploadCategory::FileMeta)
            );
        }
        other => panic!("expected direct_upload_url, got {other:?}"),
    }
}

#[test]
fn get_direct_upload_url_round_trip() {
    let cmd = round_trip(
        r#"{"cmd":"get_direct_upload_url","msgid":10,"category":"record","type":"mp4",
            "file_time":"20260217T100000.000000","duration":15000,"duration_us":15000000,
            "size":1048576,"stream_id":"Main"}"#,
    );
    match cmd.body {
        CommandBody::GetDirectUploadUrl(g) => {
            assert_eq!(g.media_type, agent_proto::MediaType::Mp4);
            assert_eq!(g.size, 1_048_576);
        }
        other => panic!("expected get_direct_upload_url, got {other:?}"),
    }
}

#[test]
fn memorycard_synchronize_round_trip() {
    let cmd = round_trip(
        r#"{"cmd":"cam_memorycard_synchronize","msgid":11,"request_id":"req-1",
            "start":"20260217T100000.000000","end":"20260217T101000.000000",
            "cancel_requests":["req-0"]}"#,
    );
    match cmd.body {
        CommandBody::CamMemorycardSynchronize(s) => {
            assert_eq!(s.cancel_requests, vec!["req-0"]);
        }
        other => panic!("expected cam_memorycard_synchronize, got {other:?}"),
    }
}

#[test]
fn synchronize_status_round_trip() {
    let cmd = round_trip(
        r#"{"cmd":"cam_memorycard_synchronize_status","msgid":12,"cam_id":1,
            "request_id":"req-1","status":"pending","progress":0}"#,
    );
    match cmd.body {
        CommandBody::CamMemorycardSynchronizeStatus(s) => {
            assert_eq!(s.status, SyncStatus::Pending);
        }
        other => panic!("expected synchronize_status, got {other:?}"),
    }
}

#[test]
fn done_round_trip_all_statuses() {
    for (text, status) in [
        ("OK", DoneStatus::Ok),
        ("CM_ERROR", DoneStatus::CmError),
        ("MISSED_PARAM", DoneStatus::MissedParam),
        ("NOT_SUPPORTED", DoneStatus::NotSupported),
        ("SYSTEM_ERROR", DoneStatus::SystemError),
        ("INVALID_PARAM", DoneStatus::InvalidParam),
    ] {
        let frame = format!(
            r#"{{"cmd":"done","msgid":13,"refid":7,"orig_cmd":"configure","status":"{text}"}}"#
        );
        let cmd = round_trip(&frame);
        match cmd.body {
            CommandBody::Done(d) => assert_eq!(d.status, status),
            other => panic!("expected done, got {other:?}"),
        }
    }
}

#[test]
fn unit_commands_parse_without_payload() {
    for frame in [
        r#"{"cmd":"get_cam_status","msgid":14}"#,
        r#"{"cmd":"get_supported_streams","msgid":15}"#,
        r#"{"cmd":"get_cam_events","msgid":16}"#,
    ] {
        round_trip(frame);
    }
}

#[test]
fn events_config_round_trip_keeps_caps() {
    let cmd = round_trip(
        r#"{"cmd":"cam_events_conf","msgid":17,"enabled":true,"events":[
            {"event":"motion","caps":{"stream":true,"snapshot":true,"periodic":false,
             "trigger":false,"stateful":true,"state_emulation":true,"internal_hidden":false},
             "active":true,"stream":true,"snapshot":false,"period":0}]}"#,
    );
    match cmd.body {
        CommandBody::CamEventsConf(c) => {
            let ev = &c.config.events[0];
            assert!(ev.caps.stateful);
            assert!(!ev.snapshot);
        }
        other => panic!("expected cam_events_conf, got {other:?}"),
    }
}
