use std::collections::BTreeMap;

use common::FieldError;
use fieldcrypt::crypto::Envelope;
use fieldcrypt::{
    is_encrypted, ColumnKind, FieldCrypto, KeyConfig, KeyManager, TypeTag, Value, ENVELOPE_PREFIX,
};
use serde_json::json;

fn crypto(secret: &str) -> FieldCrypto {
    FieldCrypto::new(KeyManager::from_secret(secret).unwrap())
}

#[test]
fn patient_name_round_trip() {
    let fc = crypto("scenario-secret");
    let stored = fc.codec.encode(Some(&Value::from("Jane Doe"))).unwrap().unwrap();

    assert!(stored.starts_with(ENVELOPE_PREFIX));
    assert!(!stored.contains("Jane"));
    assert_eq!(fc.codec.decode(Some(&stored)).unwrap(), Some(Value::from("Jane Doe")));
}

#[test]
fn integer_keeps_its_type() {
    let fc = crypto("scenario-secret");
    let stored = fc.codec.encode_value(&Value::Int(42)).unwrap();
    assert_eq!(fc.cipher.decrypt(&stored).unwrap(), "int:42");
    assert_eq!(fc.codec.decode_value(&stored).unwrap(), Value::Int(42));
}

#[test]
fn search_hash_depends_on_secret() {
    let a = crypto("secret-one").search.hash_for_search("ABC123", "");
    let b = crypto("secret-two").search.hash_for_search("ABC123", "");
    assert_eq!(a.len(), 64);
    assert_ne!(a, b);
}

#[test]
fn every_byte_flip_fails_authentication() {
    let fc = crypto("scenario-secret");
    let sealed = fc.cipher.encrypt("Allergic to penicillin").unwrap();
    let payload = Envelope::parse(&sealed).unwrap().to_payload();

    for i in 0..payload.len() {
        let mut tampered = payload.clone();
        tampered[i] ^= 0x01;
        let env = Envelope::from_payload(&tampered).unwrap();
        let err: FieldError = fc.cipher.decrypt(&env.to_string_repr()).unwrap_err().into();
        assert!(matches!(err, FieldError::Authentication), "byte {i}");
    }
}

#[test]
fn malformed_envelopes_are_encoding_errors() {
    let fc = crypto("scenario-secret");
    for bad in ["ENC:v1:!!!not-base64!!!", "ENC:v1:AAAA"] {
        let err: FieldError = fc.cipher.decrypt(bad).unwrap_err().into();
        assert_eq!(err.kind(), "encoding", "{bad}");
    }
}

#[test]
fn missing_secret_without_dev_mode_is_configuration_error() {
    let cfg = KeyConfig {
        hipaa_encryption_key: None,
        allow_dev_key: false,
        dev_key_path: ".encryption_key".into(),
    };
    let err = FieldCrypto::from_config(&cfg).unwrap_err();
    assert!(matches!(err, FieldError::Configuration(_)));
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn dev_key_file_is_reused_across_managers() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = KeyConfig {
        hipaa_encryption_key: None,
        allow_dev_key: true,
        dev_key_path: dir.path().join("dev.key"),
    };
    let first = FieldCrypto::from_config(&cfg).unwrap();
    let sealed = first.cipher.encrypt("MRN-001").unwrap();

    let second = FieldCrypto::from_config(&cfg).unwrap();
    assert_eq!(second.cipher.decrypt(&sealed).unwrap(), "MRN-001");
}

#[test]
fn record_mapper_at_the_storage_boundary() {
    let fc = crypto("scenario-secret");
    let mapper = fc
        .mapper()
        .column("last_name", ColumnKind::EncryptedString)
        .column("notes", ColumnKind::EncryptedText)
        .column("medications", ColumnKind::EncryptedJson)
        .column("mrn", ColumnKind::SearchableString);

    let record = BTreeMap::from([
        ("id".to_owned(), Some(Value::Int(7))),
        ("last_name".to_owned(), Some(Value::from("Doe"))),
        ("notes".to_owned(), Some(Value::from(""))),
        ("medications".to_owned(), Some(Value::Json(json!([{"name": "metformin"}])))),
        ("mrn".to_owned(), Some(Value::from("MRN-7"))),
    ]);
    let stored = mapper.write_record(&record).unwrap();

    assert!(is_encrypted(stored["last_name"].as_deref().unwrap()));
    assert_eq!(stored["notes"].as_deref(), Some(""));
    let mrn = stored["mrn"].as_deref().unwrap();
    let hash = mapper.lookup_hash("mrn", "MRN-7").unwrap();
    assert_eq!(mrn.split_once('|').unwrap().0, hash);

    let back = mapper.read_record(&stored).unwrap();
    assert_eq!(back["last_name"], record["last_name"]);
    assert_eq!(back["medications"], record["medications"]);
    assert_eq!(back["mrn"], record["mrn"]);
}

#[test]
fn json_column_forces_json_tag() {
    let fc = crypto("scenario-secret");
    let stored = fc.codec.encode_text("[1,2]", TypeTag::Json).unwrap();
    assert_eq!(fc.codec.decode_value(&stored).unwrap(), Value::Json(json!([1, 2])));
}
