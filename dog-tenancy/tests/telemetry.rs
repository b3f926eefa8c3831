use dog_tenancy::telemetry::{try_init_tracing, LogFormat, TelemetryError};

#[test]
fn log_format_parses_case_insensitively() {
    assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
    assert_eq!(" compact ".parse::<LogFormat>().unwrap(), LogFormat::Compact);
    assert!(matches!(
        "xml".parse::<LogFormat>(),
        Err(TelemetryError::UnknownFormat(_))
    ));
}

#[test]
fn second_install_is_reported() {
    try_init_tracing(LogFormat::Compact).unwrap();
    assert!(matches!(
        try_init_tracing(LogFormat::Json),
        Err(TelemetryError::AlreadyInstalled(_))
    ));
}
