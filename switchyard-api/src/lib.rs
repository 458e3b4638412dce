mod schema;

pub use schema::*;

#[test]
fn test_mode_schema() {
    let mode: ModeSchema = serde_json::from_str("\"global\"").unwrap();
    assert_eq!(mode, ModeSchema::Global);
    assert_eq!(serde_json::to_string(&ModeSchema::Rule).unwrap(), "\"rule\"");
    let req = r#"{"group": "auto", "selected": "hk-01"}"#;
    let req: SetGroupReqSchema = serde_json::from_str(req).unwrap();
    assert_eq!(req.selected, "hk-01");
    assert!(serde_json::from_str::<SetGroupReqSchema>(r#"{"group": "a"}"#).is_err());
}
