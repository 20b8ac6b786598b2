//! Property tests for the envelope format's boundary laws: arbitrary payload/chunk-size
//! combinations round-trip, and the wrong key never authenticates.

use proptest::prelude::*;
use vaultenc_core::envelope::{self, EnvelopeError, EnvelopeOptions, CHUNK_SIZE_MIN};
use vaultenc_core::SecureBuffer;

fn dek(seed: u8) -> SecureBuffer {
    SecureBuffer::new([seed; 32])
}

async fn round_trip(payload: &[u8], chunk_size: u32) -> Vec<u8> {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("in");
    let enc = dir.path().join("in.enc");
    let out = dir.path().join("in.out");
    tokio::fs::write(&src, payload).await.unwrap();

    let options = EnvelopeOptions { chunk_size, ..Default::default() };
    let key = dek(0x11);
    envelope::encrypt_file(&src, &enc, &key, &options).await.unwrap();
    envelope::decrypt_file(&enc, &out, &key, &options).await.unwrap();
    tokio::fs::read(&out).await.unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn arbitrary_payload_round_trips_across_chunk_sizes(
        payload in proptest::collection::vec(any::<u8>(), 0..4096),
        chunk_size in CHUNK_SIZE_MIN..(CHUNK_SIZE_MIN * 8),
    ) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let roundtripped = runtime.block_on(round_trip(&payload, chunk_size));
        prop_assert_eq!(roundtripped, payload);
    }
}

#[tokio::test]
async fn decrypting_with_the_wrong_key_never_authenticates() {
    let dir = tempfile::tempdir().unwrap();
    let src = dir.path().join("in");
    let enc = dir.path().join("in.enc");
    let out = dir.path().join("in.out");
    tokio::fs::write(&src, b"the combination is 12345").await.unwrap();

    let options = EnvelopeOptions::default();
    envelope::encrypt_file(&src, &enc, &dek(0xAA), &options).await.unwrap();

    let result = envelope::decrypt_file(&enc, &out, &dek(0xBB), &options).await;
    assert!(matches!(result, Err(EnvelopeError::AuthenticationFailed { .. })));
    assert!(tokio::fs::metadata(&out).await.is_err());
}
