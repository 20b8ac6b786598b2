//! JSON request/response shapes for the Transit-style KMS HTTP API.

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct GenerateDataKeyResponse {
    pub data: GenerateDataKeyData,
}

#[derive(Debug, Deserialize)]
pub struct GenerateDataKeyData {
    pub plaintext: String,
    pub ciphertext: String,
}

#[derive(Debug, Serialize)]
pub struct DecryptRequest {
    pub ciphertext: String,
}

#[derive(Debug, Deserialize)]
pub struct DecryptResponse {
    pub data: DecryptData,
}

#[derive(Debug, Deserialize)]
pub struct DecryptData {
    pub plaintext: String,
}

#[derive(Debug, Serialize)]
pub struct RewrapRequest {
    pub ciphertext: String,
}

#[derive(Debug, Deserialize)]
pub struct RewrapResponse {
    pub data: RewrapData,
}

#[derive(Debug, Deserialize)]
pub struct RewrapData {
    pub ciphertext: String,
}

#[derive(Debug, Deserialize)]
pub struct KeyMetadataResponse {
    pub data: KeyMetadataData,
}

#[derive(Debug, Deserialize)]
pub struct KeyMetadataData {
    pub latest_version: u32,
}
