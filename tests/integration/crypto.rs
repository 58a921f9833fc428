use cc4me::crypto;
use cc4me::sdk::error::SdkError;

#[test]
fn test_spki_round_trip() {
    let key = crypto::generate_keypair();
    let encoded = crypto::spki_der_b64(&key.verifying_key());
    let decoded = crypto::verifying_key_from_spki_b64(&encoded).unwrap();
    assert_eq!(decoded, key.verifying_key());
}

#[test]
fn test_spki_rejects_garbage() {
    assert!(crypto::verifying_key_from_spki_b64("not base64!").is_err());
    // Valid base64 that is not SPKI DER.
    assert!(crypto::verifying_key_from_spki_b64("aGVsbG8gd29ybGQ=").is_err());
}

#[test]
fn test_detached_signature_round_trip() {
    let key = crypto::generate_keypair();
    let sig = crypto::sign_detached(&key, b"the canonical string");
    assert!(crypto::verify_detached(
        &key.verifying_key(),
        b"the canonical string",
        &sig
    ));
    assert!(!crypto::verify_detached(
        &key.verifying_key(),
        b"a different string",
        &sig
    ));

    let other = crypto::generate_keypair();
    assert!(!crypto::verify_detached(
        &other.verifying_key(),
        b"the canonical string",
        &sig
    ));
}

#[test]
fn test_shared_key_commutes() {
    let alice = crypto::generate_keypair();
    let bob = crypto::generate_keypair();

    // Both directions derive the same key: ECDH commutes and the HKDF info
    // string sorts the names.
    let k_ab = crypto::derive_shared_key(&alice, &bob.verifying_key(), "alice", "bob");
    let k_ba = crypto::derive_shared_key(&bob, &alice.verifying_key(), "bob", "alice");
    assert_eq!(k_ab, k_ba);
}

#[test]
fn test_shared_key_binds_names() {
    let alice = crypto::generate_keypair();
    let bob = crypto::generate_keypair();

    let k1 = crypto::derive_shared_key(&alice, &bob.verifying_key(), "alice", "bob");
    let k2 = crypto::derive_shared_key(&alice, &bob.verifying_key(), "alice", "bobby");
    assert_ne!(k1, k2);
}

#[test]
fn test_shared_key_differs_per_pair() {
    let alice = crypto::generate_keypair();
    let bob = crypto::generate_keypair();
    let carol = crypto::generate_keypair();

    let k_ab = crypto::derive_shared_key(&alice, &bob.verifying_key(), "alice", "bob");
    let k_ac = crypto::derive_shared_key(&alice, &carol.verifying_key(), "alice", "carol");
    assert_ne!(k_ab, k_ac);
}

#[test]
fn test_encrypt_decrypt_round_trip() {
    let alice = crypto::generate_keypair();
    let bob = crypto::generate_keypair();
    let key = crypto::derive_shared_key(&alice, &bob.verifying_key(), "alice", "bob");

    let (ciphertext, nonce) = crypto::encrypt(&key, "msg-1", b"attack at dawn").unwrap();
    let plaintext = crypto::decrypt(&key, "msg-1", &ciphertext, &nonce).unwrap();
    assert_eq!(plaintext, b"attack at dawn");
}

#[test]
fn test_decrypt_rejects_wrong_key() {
    let alice = crypto::generate_keypair();
    let bob = crypto::generate_keypair();
    let carol = crypto::generate_keypair();
    let k_ab = crypto::derive_shared_key(&alice, &bob.verifying_key(), "alice", "bob");
    let k_ac = crypto::derive_shared_key(&alice, &carol.verifying_key(), "alice", "carol");

    let (ciphertext, nonce) = crypto::encrypt(&k_ab, "msg-1", b"secret").unwrap();
    assert!(matches!(
        crypto::decrypt(&k_ac, "msg-1", &ciphertext, &nonce),
        Err(SdkError::DecryptionFailed)
    ));
}

#[test]
fn test_decrypt_rejects_wrong_message_id_aad() {
    let alice = crypto::generate_keypair();
    let bob = crypto::generate_keypair();
    let key = crypto::derive_shared_key(&alice, &bob.verifying_key(), "alice", "bob");

    let (ciphertext, nonce) = crypto::encrypt(&key, "msg-1", b"secret").unwrap();
    assert!(matches!(
        crypto::decrypt(&key, "msg-2", &ciphertext, &nonce),
        Err(SdkError::DecryptionFailed)
    ));
}

#[test]
fn test_decrypt_rejects_tampered_ciphertext() {
    use base64::Engine;
    let alice = crypto::generate_keypair();
    let bob = crypto::generate_keypair();
    let key = crypto::derive_shared_key(&alice, &bob.verifying_key(), "alice", "bob");

    let (ciphertext, nonce) = crypto::encrypt(&key, "msg-1", b"secret").unwrap();
    let mut bytes = base64::engine::general_purpose::STANDARD
        .decode(&ciphertext)
        .unwrap();
    bytes[0] ^= 0x01;
    let tampered = base64::engine::general_purpose::STANDARD.encode(bytes);
    assert!(crypto::decrypt(&key, "msg-1", &tampered, &nonce).is_err());
}

#[test]
fn test_nonces_are_fresh() {
    let alice = crypto::generate_keypair();
    let bob = crypto::generate_keypair();
    let key = crypto::derive_shared_key(&alice, &bob.verifying_key(), "alice", "bob");

    let (c1, n1) = crypto::encrypt(&key, "msg-1", b"same plaintext").unwrap();
    let (c2, n2) = crypto::encrypt(&key, "msg-1", b"same plaintext").unwrap();
    assert_ne!(n1, n2);
    assert_ne!(c1, c2);
}

#[test]
fn test_canonical_string_layout() {
    let canonical = cc4me::auth::canonical_string(
        "POST",
        "/contacts/request",
        "2026-08-01T00:00:00+00:00",
        "abc123",
    );
    assert_eq!(
        canonical,
        "POST /contacts/request\n2026-08-01T00:00:00+00:00\nabc123"
    );
}

#[test]
fn test_empty_body_hash_is_sha256_of_empty() {
    assert_eq!(
        cc4me::auth::empty_body_hash(),
        "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
    );
}
