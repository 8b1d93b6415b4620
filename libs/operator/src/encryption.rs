//! Encryption Adapter: transforms a `Secret`'s canonical YAML into an
//! age-encrypted, minimal SOPS-compatible envelope before the commit
//! worker writes it to `{...}/{name}.sops.yaml`.
//!
//! Age encryption is randomized (a fresh ephemeral key per call), so the
//! ciphertext differs across calls even for identical plaintext. The
//! dedup fingerprint the commit worker keys on is computed from the
//! *plaintext* instead, kept alongside (not derived from) the ciphertext
//! bytes that get written.

use std::str::FromStr;

use age::secrecy::ExposeSecret;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use thiserror::Error;
use xxhash_rust::xxh64::xxh64;

const IDENTITY_KEY: &str = "identity.agekey";
const RECIPIENT_ANNOTATION: &str = "gitmirror.io/recipient";
const REMOVE_AFTER_BACKUP_ANNOTATION: &str = "gitmirror.io/remove-after-backup";

#[derive(Debug, Error)]
pub enum Error {
    #[error("encryption secret {0}/{1} missing or malformed")]
    MalformedIdentity(String, String),
    #[error("failed to generate or persist age identity: {0}")]
    Generate(#[source] kube::Error),
    #[error("age encryption failed: {0}")]
    Encrypt(String),
    #[error("age decryption failed: {0}")]
    Decrypt(String),
}

pub struct EncryptedPayload {
    /// The full SOPS-compatible envelope bytes written to disk.
    pub envelope_yaml: Vec<u8>,
    /// Fingerprint of the plaintext input, used for dedup instead of a
    /// hash of the (non-deterministic) ciphertext.
    pub plaintext_fingerprint: u64,
}

pub struct EncryptionAdapter {
    client: Client,
}

impl EncryptionAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Encrypts `plaintext_yaml` for the recipient configured (or lazily
    /// generated) in `namespace/secret_name`.
    pub async fn encrypt(&self, namespace: &str, secret_name: &str, plaintext_yaml: &[u8]) -> Result<EncryptedPayload, Error> {
        let recipient = self.load_or_generate_recipient(namespace, secret_name).await?;

        let encryptor = age::Encryptor::with_recipients(vec![Box::new(recipient.clone())])
            .map_err(|e| Error::Encrypt(e.to_string()))?;
        let mut armored = Vec::new();
        {
            let mut writer = encryptor
                .wrap_output(age::armor::ArmoredWriter::wrap_output(&mut armored, age::armor::Format::AsciiArmor).map_err(|e| Error::Encrypt(e.to_string()))?)
                .map_err(|e| Error::Encrypt(e.to_string()))?;
            std::io::Write::write_all(&mut writer, plaintext_yaml).map_err(|e| Error::Encrypt(e.to_string()))?;
            writer.finish().map_err(|e| Error::Encrypt(e.to_string()))?;
        }
        let armored_text = String::from_utf8(armored).map_err(|e| Error::Encrypt(e.to_string()))?;

        let envelope = SopsEnvelope {
            sops: SopsMeta {
                age: vec![AgeRecipientEntry {
                    recipient: recipient.to_string(),
                }],
                version: env!("CARGO_PKG_VERSION").to_owned(),
            },
            data: armored_text,
        };
        let envelope_yaml = serde_yaml::to_string(&envelope)
            .map_err(|e| Error::Encrypt(e.to_string()))?
            .into_bytes();

        Ok(EncryptedPayload {
            envelope_yaml,
            plaintext_fingerprint: xxh64(plaintext_yaml, 0),
        })
    }

    async fn load_or_generate_recipient(&self, namespace: &str, secret_name: &str) -> Result<age::x25519::Recipient, Error> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);

        if let Ok(secret) = secrets.get(secret_name).await {
            if let Some(key_bytes) = secret.data.as_ref().and_then(|d| d.get(IDENTITY_KEY)) {
                let key_str = String::from_utf8(key_bytes.0.clone())
                    .map_err(|_| Error::MalformedIdentity(namespace.to_owned(), secret_name.to_owned()))?;
                let identity = age::x25519::Identity::from_str(key_str.trim())
                    .map_err(|_| Error::MalformedIdentity(namespace.to_owned(), secret_name.to_owned()))?;
                return Ok(identity.to_public());
            }
        }

        // No identity yet: generate lazily on this first encrypted write
        // (see DESIGN.md); a crash before this write loses the generated
        // identity, which is acceptable because the operator only
        // mirrors, it never reconstructs history.
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public();

        let mut annotations = std::collections::BTreeMap::new();
        annotations.insert(RECIPIENT_ANNOTATION.to_owned(), recipient.to_string());
        annotations.insert(REMOVE_AFTER_BACKUP_ANNOTATION.to_owned(), "true".to_owned());

        let mut data = std::collections::BTreeMap::new();
        data.insert(
            IDENTITY_KEY.to_owned(),
            ByteString(identity.to_string().expose_secret().as_bytes().to_vec()),
        );

        let secret = Secret {
            metadata: ObjectMeta {
                name: Some(secret_name.to_owned()),
                namespace: Some(namespace.to_owned()),
                annotations: Some(annotations),
                ..Default::default()
            },
            data: Some(data),
            ..Default::default()
        };

        match secrets.create(&PostParams::default(), &secret).await {
            Ok(_) => {}
            Err(kube::Error::Api(e)) if e.code == 409 => {
                secrets
                    .patch(secret_name, &PatchParams::apply("gitmirror-operator"), &Patch::Apply(&secret))
                    .await
                    .map_err(Error::Generate)?;
            }
            Err(e) => return Err(Error::Generate(e)),
        }

        Ok(recipient)
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SopsEnvelope {
    sops: SopsMeta,
    data: String,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct SopsMeta {
    age: Vec<AgeRecipientEntry>,
    version: String,
}

#[derive(serde::Serialize, serde::Deserialize)]
struct AgeRecipientEntry {
    recipient: String,
}

/// Decrypts an envelope produced by [`EncryptionAdapter::encrypt`] back
/// to its plaintext YAML, used by tests and by the (out-of-scope)
/// operator's own diagnostics tooling.
pub fn decrypt(envelope_yaml: &[u8], identity: &age::x25519::Identity) -> Result<Vec<u8>, Error> {
    let envelope: SopsEnvelope = serde_yaml::from_slice(envelope_yaml).map_err(|e| Error::Decrypt(e.to_string()))?;
    let decryptor = match age::Decryptor::new(envelope.data.as_bytes()).map_err(|e| Error::Decrypt(e.to_string()))? {
        age::Decryptor::Recipients(d) => d,
        age::Decryptor::Passphrase(_) => return Err(Error::Decrypt("unexpected passphrase-protected envelope".to_owned())),
    };
    let mut plaintext = Vec::new();
    let mut reader = decryptor
        .decrypt(std::iter::once(identity as &dyn age::Identity))
        .map_err(|e| Error::Decrypt(e.to_string()))?;
    std::io::Read::read_to_end(&mut reader, &mut plaintext).map_err(|e| Error::Decrypt(e.to_string()))?;
    Ok(plaintext)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plaintext_fingerprint_is_stable_across_distinct_ciphertexts() {
        let identity = age::x25519::Identity::generate();
        let recipient = identity.to_public();
        let plaintext = b"apiVersion: v1\nkind: Secret\ndata:\n  password: YWJj\n";

        let encrypt_once = || {
            let encryptor = age::Encryptor::with_recipients(vec![Box::new(recipient.clone())]).unwrap();
            let mut out = Vec::new();
            let mut w = encryptor
                .wrap_output(age::armor::ArmoredWriter::wrap_output(&mut out, age::armor::Format::AsciiArmor).unwrap())
                .unwrap();
            std::io::Write::write_all(&mut w, plaintext).unwrap();
            w.finish().unwrap();
            out
        };

        let a = encrypt_once();
        let b = encrypt_once();
        assert_ne!(a, b, "age encryption should be randomized per call");
        assert_eq!(xxh64(plaintext, 0), xxh64(plaintext, 0));
    }
}
