//! Unit tests for error display and conversions.

use agent_bridge::AppError;

#[test]
fn display_prefixes_kind() {
    assert_eq!(AppError::Spawn("no runtime".into()).to_string(), "spawn: no runtime");
    assert_eq!(
        AppError::ProcessExit("code 2".into()).to_string(),
        "process exit: code 2"
    );
    assert_eq!(AppError::Timeout("late".into()).to_string(), "timeout: late");
}

#[test]
fn message_strips_kind() {
    assert_eq!(AppError::Send("quota".into()).message(), "quota");
}

#[test]
fn conversions_pick_matching_kind() {
    let io: AppError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
    assert!(matches!(io, AppError::Io(_)));

    let json: AppError = serde_json::from_str::<serde_json::Value>("{")
        .expect_err("malformed")
        .into();
    assert!(matches!(json, AppError::Stream(_)));

    let toml: AppError = toml::from_str::<toml::Value>("= 1").expect_err("malformed").into();
    assert!(matches!(toml, AppError::Config(_)));
}
