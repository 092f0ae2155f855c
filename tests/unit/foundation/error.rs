use super::*;

#[test]
fn display_prefixes_are_stable() {
    assert!(
        AnimakeError::validation("x")
            .to_string()
            .contains("validation error:")
    );
    assert!(
        AnimakeError::overlap("x")
            .to_string()
            .contains("overlap error:")
    );
    assert!(
        AnimakeError::generation("x")
            .to_string()
            .contains("generation error:")
    );
    assert!(
        AnimakeError::unauthorized("x")
            .to_string()
            .contains("unauthorized:")
    );
    assert!(
        AnimakeError::cache_io("x")
            .to_string()
            .contains("cache io error:")
    );
    assert!(
        AnimakeError::serde("x")
            .to_string()
            .contains("serialization error:")
    );
}

#[test]
fn conflict_reports_both_versions() {
    let err = AnimakeError::Conflict { base: 2, latest: 3 };
    let msg = err.to_string();
    assert!(msg.contains("version 2"));
    assert!(msg.contains("latest is 3"));
    assert_eq!(err.kind(), "conflict");
}

#[test]
fn render_errors_convert_transparently() {
    let err: AnimakeError = RenderError::timeout("exceeded 30s").into();
    assert_eq!(err.kind(), "render");
    assert!(err.to_string().contains("timeout"));
    assert!(err.to_string().contains("exceeded 30s"));
}

#[test]
fn render_error_json_omits_empty_diagnostics() {
    let json = serde_json::to_value(RenderError::canceled()).unwrap();
    assert_eq!(json["kind"], "canceled");
    assert!(json.get("exit_code").is_none());
    assert!(json.get("stderr").is_none());
}

#[test]
fn other_preserves_source() {
    let base = std::io::Error::other("boom");
    let err = AnimakeError::Other(anyhow::Error::new(base));
    assert!(err.to_string().contains("boom"));
}

#[test]
fn unauthorized_has_its_own_kind() {
    assert_eq!(AnimakeError::unauthorized("bad key").kind(), "unauthorized");
}
