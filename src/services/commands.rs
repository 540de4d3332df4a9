//! Command channel protocol.
//!
//! Requests are JSON objects naming a command in their `cmd` field. Every
//! request gets exactly one JSON response, either
//! `{"success":true,"ic":..,"memory":..}` or
//! `{"success":false,"code":..,"msg":..}`.

use crate::config_store::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_repr::{Deserialize_repr, Serialize_repr};
use serde_valid::Validate;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Name of the set configuration command.
pub const SET_CONFIG: &str = "cfg";

/// Fields a set configuration request must carry, in the order they are checked.
pub const REQUIRED_FIELDS: [&str; 6] = [
    "ap_name",
    "ap_pass",
    "mqtt_ip",
    "mqtt_port",
    "mqtt_user",
    "mqtt_pass",
];

const MAX_MESSAGE_LEN: usize = 120;

/// Byte limits of the set configuration strings. Together they bound the
/// escaped size of the persisted record.
pub const AP_NAME_MAX: usize = 20;
pub const AP_PASS_MAX: usize = 20;
pub const MQTT_USER_MAX: usize = 10;
pub const MQTT_PASS_MAX: usize = 10;

/// Numeric error code reported to the peer.
#[derive(Clone, Copy, Debug, Deserialize_repr, PartialEq, Eq, Serialize_repr)]
#[repr(u8)]
pub enum ErrorCode {
    BadJson = 11,
    MissingCommand = 12,
    UnknownCommand = 13,
    Validation = 14,
    StationConfig = 15,
    ConfigWrite = 16,
    WrongStage = 19,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("could not decode json")]
    BadJson(#[source] serde_json::Error),
    #[error("bad command format")]
    MissingCommand,
    #[error("unknown command {0}")]
    UnknownCommand(String),
    #[error("missing {0} key")]
    MissingField(&'static str),
    #[error("invalid field: {0}")]
    InvalidField(String),
    #[error("unexpected stage")]
    WrongStage,
    #[error("failed setting access point")]
    StationConfig(#[source] anyhow::Error),
    #[error("failed writing config")]
    ConfigWrite(#[source] StoreError),
}

impl CommandError {
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::BadJson(_) => ErrorCode::BadJson,
            Self::MissingCommand => ErrorCode::MissingCommand,
            Self::UnknownCommand(_) => ErrorCode::UnknownCommand,
            Self::MissingField(_) | Self::InvalidField(_) => ErrorCode::Validation,
            Self::WrongStage => ErrorCode::WrongStage,
            Self::StationConfig(_) => ErrorCode::StationConfig,
            Self::ConfigWrite(_) => ErrorCode::ConfigWrite,
        }
    }
}

/// Payload of the set configuration command.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Validate)]
pub struct SetConfig {
    #[validate(min_length = 1)]
    pub ap_name: String,
    pub ap_pass: String,
    pub mqtt_ip: Ipv4Addr,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    SetConfig(SetConfig),
}

/// Parse and validate a decrypted request.
pub fn parse(request: &[u8]) -> Result<Command, CommandError> {
    let value: Value = serde_json::from_slice(request).map_err(CommandError::BadJson)?;

    let name = value
        .get("cmd")
        .and_then(Value::as_str)
        .ok_or(CommandError::MissingCommand)?;

    match name {
        SET_CONFIG => parse_set_config(value).map(Command::SetConfig),
        other => Err(CommandError::UnknownCommand(other.to_string())),
    }
}

fn parse_set_config(value: Value) -> Result<SetConfig, CommandError> {
    if let Some(missing) = REQUIRED_FIELDS.into_iter().find(|k| value.get(*k).is_none()) {
        return Err(CommandError::MissingField(missing));
    }

    let config: SetConfig =
        serde_json::from_value(value).map_err(|e| CommandError::InvalidField(e.to_string()))?;

    config
        .validate()
        .map_err(|e| CommandError::InvalidField(e.to_string()))?;

    check_len("ap_name", &config.ap_name, AP_NAME_MAX)?;
    check_len("ap_pass", &config.ap_pass, AP_PASS_MAX)?;
    check_len("mqtt_user", &config.mqtt_user, MQTT_USER_MAX)?;
    check_len("mqtt_pass", &config.mqtt_pass, MQTT_PASS_MAX)?;

    Ok(config)
}

fn check_len(field: &str, value: &str, max: usize) -> Result<(), CommandError> {
    if value.len() > max {
        return Err(CommandError::InvalidField(format!(
            "{field} exceeds {max} bytes"
        )));
    }
    Ok(())
}

#[derive(Clone, Debug, Deserialize, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Success {
        success: bool,
        ic: String,
        memory: u32,
    },
    Failure {
        success: bool,
        code: ErrorCode,
        msg: String,
    },
}

impl Response {
    /// `ic` identifies the device, `memory` is its flash size in bytes.
    pub fn success(ic: String, memory: u32) -> Self {
        Self::Success {
            success: true,
            ic,
            memory,
        }
    }

    pub fn failure(error: &CommandError) -> Self {
        let mut msg = error.to_string();
        if msg.len() > MAX_MESSAGE_LEN {
            let mut end = MAX_MESSAGE_LEN;
            while !msg.is_char_boundary(end) {
                end -= 1;
            }
            msg.truncate(end);
        }

        Self::Failure {
            success: false,
            code: error.code(),
            msg,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { success: true, .. })
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> Value {
        json!({
            "cmd": "cfg",
            "ap_name": "home",
            "ap_pass": "secret123",
            "mqtt_ip": "10.0.0.5",
            "mqtt_port": 1883,
            "mqtt_user": "device",
            "mqtt_pass": "hunter2"
        })
    }

    fn parse_value(value: &Value) -> Result<Command, CommandError> {
        parse(value.to_string().as_bytes())
    }

    mod parsing {
        use super::*;

        #[test]
        fn valid_set_config() {
            let Command::SetConfig(cfg) = parse_value(&request()).expect("valid request");

            assert_eq!(cfg.ap_name, "home");
            assert_eq!(cfg.mqtt_ip, Ipv4Addr::new(10, 0, 0, 5));
            assert_eq!(cfg.mqtt_port, 1883);
        }

        #[test]
        fn malformed_json() {
            let err = parse(b"{\"cmd\":").unwrap_err();
            assert_eq!(err.code(), ErrorCode::BadJson);
            assert_eq!(err.to_string(), "could not decode json");
        }

        #[test]
        fn missing_or_non_string_command() {
            let err = parse(b"{\"ap_name\":\"x\"}").unwrap_err();
            assert_eq!(err.code(), ErrorCode::MissingCommand);

            let err = parse(b"{\"cmd\":5}").unwrap_err();
            assert_eq!(err.code(), ErrorCode::MissingCommand);
        }

        #[test]
        fn unknown_command() {
            let err = parse(b"{\"cmd\":\"reboot\"}").unwrap_err();
            assert_eq!(err.code(), ErrorCode::UnknownCommand);
        }
    }

    mod validation {
        use super::*;

        #[test]
        fn each_missing_field_is_reported_by_name() {
            for field in REQUIRED_FIELDS {
                let mut req = request();
                req.as_object_mut().expect("object").remove(field);

                let err = parse_value(&req).unwrap_err();
                assert_eq!(err.code(), ErrorCode::Validation);
                assert_eq!(err.to_string(), format!("missing {field} key"));
            }
        }

        #[test]
        fn first_missing_field_wins() {
            let req = json!({"cmd": "cfg", "mqtt_port": 1});
            let err = parse_value(&req).unwrap_err();
            assert_eq!(err.to_string(), "missing ap_name key");
        }

        #[test]
        fn bad_broker_address() {
            let mut req = request();
            req["mqtt_ip"] = json!("10.0.0");

            let err = parse_value(&req).unwrap_err();
            assert!(matches!(err, CommandError::InvalidField(_)));
        }

        #[test]
        fn port_out_of_range() {
            let mut req = request();
            req["mqtt_port"] = json!(70000);

            assert_eq!(parse_value(&req).unwrap_err().code(), ErrorCode::Validation);
        }

        #[test]
        fn empty_or_long_ap_name() {
            let mut req = request();
            req["ap_name"] = json!("");
            assert_eq!(parse_value(&req).unwrap_err().code(), ErrorCode::Validation);

            req["ap_name"] = json!("x".repeat(AP_NAME_MAX + 1));
            assert_eq!(parse_value(&req).unwrap_err().code(), ErrorCode::Validation);
        }

        #[test]
        fn limits_count_bytes() {
            let mut req = request();
            req["ap_name"] = json!("\u{1F600}".repeat(AP_NAME_MAX / 4));
            req["mqtt_pass"] = json!("\u{1}".repeat(MQTT_PASS_MAX));
            assert!(parse_value(&req).is_ok());

            req["mqtt_user"] = json!("\u{e9}".repeat(MQTT_USER_MAX / 2 + 1));
            let err = parse_value(&req).unwrap_err();
            assert_eq!(err.code(), ErrorCode::Validation);
            assert_eq!(err.to_string(), "invalid field: mqtt_user exceeds 10 bytes");
        }
    }

    mod responses {
        use super::*;

        #[test]
        fn success_wire_format() {
            let bytes = Response::success("5CCF7F0A1BFF".into(), 4_194_304)
                .to_bytes()
                .expect("encode");

            assert_eq!(
                serde_json::from_slice::<Value>(&bytes).expect("json"),
                json!({"success": true, "ic": "5CCF7F0A1BFF", "memory": 4_194_304})
            );
        }

        #[test]
        fn failure_wire_format() {
            let response = Response::failure(&CommandError::WrongStage);
            let bytes = response.to_bytes().expect("encode");

            assert!(!response.is_success());
            assert_eq!(
                serde_json::from_slice::<Value>(&bytes).expect("json"),
                json!({"success": false, "code": 19, "msg": "unexpected stage"})
            );
        }

        #[test]
        fn long_messages_are_truncated() {
            let response = Response::failure(&CommandError::InvalidField("é".repeat(200)));

            let Response::Failure { msg, .. } = response else {
                panic!("expected failure");
            };
            assert!(msg.len() <= MAX_MESSAGE_LEN);
            assert!(msg.starts_with("invalid field: "));
        }
    }
}
