//! End-to-end `encrypt`/`decrypt` through the real binary against a mocked Transit
//! backend.

use assert_cmd::Command;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_toml(server_uri: &str, dir: &std::path::Path) -> String {
    format!(
        r#"
[vault]
agent_address = "{server_uri}"
transit_mount = "transit"
key_name = "vaultenc"

[encryption]
source_dir = "{src}"
dest_dir = "{dst}"

[decryption]
source_dir = "{src}"
dest_dir = "{dst}"
"#,
        src = dir.join("enc_in").display(),
        dst = dir.join("enc_out").display(),
    )
}

#[tokio::test]
async fn encrypt_then_decrypt_round_trips_through_the_binary() {
    let server = MockServer::start().await;
    let dek = [9u8; 32];
    let dek_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, dek);

    Mock::given(method("POST"))
        .and(path("/v1/transit/datakey/plaintext/vaultenc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": { "plaintext": dek_b64, "ciphertext": "vault:v1:wrapped" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/transit/decrypt/vaultenc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": { "plaintext": dek_b64 }
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("enc_in")).unwrap();
    std::fs::create_dir_all(dir.path().join("enc_out")).unwrap();
    let config_path = dir.path().join("vaultenc.toml");
    std::fs::write(&config_path, config_toml(&server.uri(), dir.path())).unwrap();

    let plaintext_path = dir.path().join("secret.txt");
    std::fs::write(&plaintext_path, b"this stays confidential").unwrap();
    let encrypted_path = dir.path().join("secret.txt.enc");

    Command::cargo_bin("vaultenc")
        .unwrap()
        .args(["encrypt", "-i"])
        .arg(&plaintext_path)
        .arg("-o")
        .arg(&encrypted_path)
        .arg("-c")
        .arg(&config_path)
        .assert()
        .success();
    assert!(encrypted_path.exists());

    let key_path = dir.path().join("secret.txt.key");
    assert!(key_path.exists());

    let decrypted_path = dir.path().join("secret.txt.out");
    Command::cargo_bin("vaultenc")
        .unwrap()
        .args(["decrypt", "-i"])
        .arg(&encrypted_path)
        .arg("-k")
        .arg(&key_path)
        .arg("-o")
        .arg(&decrypted_path)
        .arg("-c")
        .arg(&config_path)
        .assert()
        .success();

    let roundtripped = std::fs::read(&decrypted_path).unwrap();
    assert_eq!(roundtripped, b"this stays confidential");
}

#[tokio::test]
async fn decrypt_finds_the_key_sidecar_without_an_explicit_flag() {
    let server = MockServer::start().await;
    let dek = [5u8; 32];
    let dek_b64 = base64::Engine::encode(&base64::engine::general_purpose::STANDARD, dek);

    Mock::given(method("POST"))
        .and(path("/v1/transit/datakey/plaintext/vaultenc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": { "plaintext": dek_b64, "ciphertext": "vault:v1:wrapped" }
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/transit/decrypt/vaultenc"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "data": { "plaintext": dek_b64 }
        })))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    std::fs::create_dir_all(dir.path().join("enc_in")).unwrap();
    std::fs::create_dir_all(dir.path().join("enc_out")).unwrap();
    let config_path = dir.path().join("vaultenc.toml");
    std::fs::write(&config_path, config_toml(&server.uri(), dir.path())).unwrap();

    let plaintext_path = dir.path().join("report.txt");
    std::fs::write(&plaintext_path, b"numbers go up").unwrap();
    let encrypted_path = dir.path().join("report.txt.enc");

    Command::cargo_bin("vaultenc")
        .unwrap()
        .args(["encrypt", "-i"])
        .arg(&plaintext_path)
        .arg("-o")
        .arg(&encrypted_path)
        .arg("-c")
        .arg(&config_path)
        .assert()
        .success();

    // encrypt writes `report.txt.key`, named after the plaintext, not `report.txt.enc.key`.
    let decrypted_path = dir.path().join("report.txt.out");
    Command::cargo_bin("vaultenc")
        .unwrap()
        .args(["decrypt", "-i"])
        .arg(&encrypted_path)
        .arg("-o")
        .arg(&decrypted_path)
        .arg("-c")
        .arg(&config_path)
        .assert()
        .success();

    let roundtripped = std::fs::read(&decrypted_path).unwrap();
    assert_eq!(roundtripped, b"numbers go up");
}
