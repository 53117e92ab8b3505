use observatory::config::MaskingConfig;
use observatory::masker::SensitiveDataMasker;
use serde_json::{json, Value};

fn masker() -> SensitiveDataMasker {
    SensitiveDataMasker::from_config(&MaskingConfig::default())
}

#[test]
fn test_masking_is_idempotent() {
    let masker = masker();
    let input = json!({
        "user": {"email": "ann@example.test", "password": "hunter2"},
        "payment": [{"card_number": "4111111111111111", "amount": 12}],
        "api_token": "t-1",
    });

    let once = masker.mask_value(&input);
    let twice = masker.mask_value(&once);
    assert_eq!(once, twice);
    assert_ne!(once, input);
}

#[test]
fn test_non_sensitive_values_pass_through() {
    let masker = masker();
    let input = json!({"sku": "A-1", "qty": 2, "tags": ["x", "y"], "nested": {"note": null}});
    assert_eq!(masker.mask_value(&input), input);
}

#[test]
fn test_no_sensitive_value_survives() {
    let masker = masker();
    let input = json!({
        "password": "hunter2",
        "profile": {"secret_answer": "blue", "client": {"access_token": "abc"}},
    });
    let text = masker.mask_value(&input).to_string();
    for leaked in ["hunter2", "blue", "abc"] {
        assert!(!text.contains(leaked), "{} leaked in {}", leaked, text);
    }
}

#[test]
fn test_json_text_and_scalars() {
    let masker = masker();
    let masked: Value = serde_json::from_str(&masker.mask_json(r#"{"cvv":"123","zip":"98101"}"#)).unwrap();
    assert_eq!(masked["zip"], "98101");
    assert_ne!(masked["cvv"], "123");

    assert_eq!(masker.mask_json("plain text body"), "plain text body");
    assert_eq!(masker.mask_value(&json!(42)), json!(42));
}

#[test]
fn test_truncation_bounds_length() {
    let masker = masker();
    let long = "x".repeat(500);
    let cut = masker.truncate(&long, 100);
    assert!(cut.ends_with("... [truncated]"));
    assert!(cut.chars().count() <= 100 + "... [truncated]".len());
    assert_eq!(masker.truncate("short", 100), "short");
}
