//! SSH connectivity artifact: key pair, host list and client config
//!
//! The artifact lives in two objects per job:
//! - Secret `<job>-ssh` holding the key pair
//! - ConfigMap `<job>-config` holding `hostfile` and `ssh-config`
//!
//! Key material is generated once. When the secret already exists it is
//! reused as-is so public keys already distributed to workers stay valid.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use k8s_openapi::api::core::v1::{
    ConfigMap, ConfigMapProjection, KeyToPath, ProjectedVolumeSource, Secret, SecretProjection,
    Volume, VolumeProjection,
};
use k8s_openapi::ByteString;
use rcgen::KeyPair;

use mpi_common::crd::MPIJob;

use crate::builder::{job_labels, job_name, object_meta, worker_name};
use crate::error::JobError;

/// ConfigMap key holding the host list
pub const HOSTFILE_KEY: &str = "hostfile";
/// ConfigMap key holding the SSH client config
pub const SSH_CONFIG_KEY: &str = "ssh-config";
/// Secret key holding the PKCS#8 private key
pub const PRIVATE_KEY_KEY: &str = "ssh-privatekey";
/// Secret key holding the OpenSSH public key line
pub const PUBLIC_KEY_KEY: &str = "ssh-publickey";

/// Volume carrying SSH material into every unit
pub const SSH_AUTH_VOLUME: &str = "ssh-auth";

const SSH_KEY_TYPE: &str = "ecdsa-sha2-nistp256";
const SSH_CURVE: &str = "nistp256";

pub fn config_map_name(job_name: &str) -> String {
    format!("{job_name}-config")
}

pub fn ssh_secret_name(job_name: &str) -> String {
    format!("{job_name}-ssh")
}

/// One line per worker ordinal, ascending: `<job>-worker-<i> slots=<slots>`.
///
/// Rank assignment follows line order, so the order must never change.
pub fn build_hostfile(job_name: &str, workers: u32, slots: u32) -> String {
    (0..workers)
        .map(|i| format!("{} slots={}\n", worker_name(job_name, i), slots))
        .collect()
}

/// Client config for launcher-to-worker sessions.
///
/// Workers are recreated on every attempt with fresh host keys and are only
/// reachable inside the cluster, so host verification is disabled.
pub fn build_ssh_config() -> String {
    [
        "Host *",
        "    StrictHostKeyChecking no",
        "    UserKnownHostsFile /dev/null",
        "    LogLevel ERROR",
        "",
    ]
    .join("\n")
}

/// Generated SSH key pair
#[derive(Clone, Debug)]
pub struct SshKeyPair {
    /// PKCS#8 PEM
    pub private_key_pem: String,
    /// `ecdsa-sha2-nistp256 <base64> <comment>`
    pub public_key: String,
}

/// Generate an ECDSA P-256 key pair in formats OpenSSH accepts
pub fn generate_ssh_key_pair(comment: &str) -> Result<SshKeyPair, JobError> {
    let key_pair = KeyPair::generate()
        .map_err(|e| JobError::KeyGeneration(format!("failed to generate ssh key: {e}")))?;

    Ok(SshKeyPair {
        private_key_pem: key_pair.serialize_pem(),
        public_key: openssh_public_key(key_pair.public_key_raw(), comment),
    })
}

/// Encode an uncompressed P-256 point as an OpenSSH `authorized_keys` line
fn openssh_public_key(point: &[u8], comment: &str) -> String {
    let mut blob = Vec::with_capacity(4 + SSH_KEY_TYPE.len() + 4 + SSH_CURVE.len() + 4 + point.len());
    for field in [SSH_KEY_TYPE.as_bytes(), SSH_CURVE.as_bytes(), point] {
        blob.extend_from_slice(&(field.len() as u32).to_be_bytes());
        blob.extend_from_slice(field);
    }
    format!("{SSH_KEY_TYPE} {} {comment}", STANDARD.encode(blob))
}

/// Public key stored in an existing secret
pub fn public_key_of(secret: &Secret) -> Option<String> {
    let from_data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(PUBLIC_KEY_KEY))
        .and_then(|b| String::from_utf8(b.0.clone()).ok());
    from_data.or_else(|| {
        secret
            .string_data
            .as_ref()
            .and_then(|d| d.get(PUBLIC_KEY_KEY))
            .cloned()
    })
}

pub fn build_ssh_secret(job: &MPIJob, keys: &SshKeyPair) -> Secret {
    let name = job_name(job);
    Secret {
        metadata: object_meta(job, ssh_secret_name(name), job_labels(name)),
        type_: Some("kubernetes.io/ssh-auth".to_string()),
        data: Some(BTreeMap::from([
            (
                PRIVATE_KEY_KEY.to_string(),
                ByteString(keys.private_key_pem.clone().into_bytes()),
            ),
            (
                PUBLIC_KEY_KEY.to_string(),
                ByteString(keys.public_key.clone().into_bytes()),
            ),
        ])),
        ..Default::default()
    }
}

pub fn build_config_map(job: &MPIJob) -> ConfigMap {
    let name = job_name(job);
    ConfigMap {
        metadata: object_meta(job, config_map_name(name), job_labels(name)),
        data: Some(BTreeMap::from([
            (
                HOSTFILE_KEY.to_string(),
                build_hostfile(name, job.spec.worker_replicas(), job.spec.slots()),
            ),
            (SSH_CONFIG_KEY.to_string(), build_ssh_config()),
        ])),
        ..Default::default()
    }
}

/// Desired connectivity objects for a job
#[derive(Clone, Debug)]
pub struct ConnectivityArtifact {
    pub secret: Secret,
    pub config_map: ConfigMap,
    /// False when `secret` is the existing one passed in
    pub generated: bool,
}

/// Build the artifact, reusing `existing` key material when present
pub fn build_connectivity_artifact(
    job: &MPIJob,
    existing: Option<&Secret>,
) -> Result<ConnectivityArtifact, JobError> {
    let (secret, generated) = match existing {
        Some(secret) => {
            if public_key_of(secret).is_none() {
                let name = secret.metadata.name.clone().unwrap_or_default();
                return Err(JobError::MalformedSecret(name));
            }
            (secret.clone(), false)
        }
        None => {
            let keys = generate_ssh_key_pair(&format!("{}@mpi-operator", job_name(job)))?;
            (build_ssh_secret(job, &keys), true)
        }
    };

    Ok(ConnectivityArtifact {
        secret,
        config_map: build_config_map(job),
        generated,
    })
}

fn key_to_path(key: &str, path: &str) -> KeyToPath {
    KeyToPath {
        key: key.to_string(),
        path: path.to_string(),
        ..Default::default()
    }
}

/// Read-only projected volume with the SSH material for one role.
///
/// Workers get the public key as `authorized_keys`. The launcher also gets
/// the private key and the client config.
pub fn ssh_auth_volume(job_name: &str, launcher: bool) -> Volume {
    let mut secret_items = vec![
        key_to_path(PUBLIC_KEY_KEY, "id_ecdsa.pub"),
        key_to_path(PUBLIC_KEY_KEY, "authorized_keys"),
    ];
    let mut sources = Vec::new();

    if launcher {
        secret_items.push(key_to_path(PRIVATE_KEY_KEY, "id_ecdsa"));
        sources.push(VolumeProjection {
            config_map: Some(ConfigMapProjection {
                name: config_map_name(job_name),
                items: Some(vec![key_to_path(SSH_CONFIG_KEY, "config")]),
                ..Default::default()
            }),
            ..Default::default()
        });
    }

    sources.insert(
        0,
        VolumeProjection {
            secret: Some(SecretProjection {
                name: ssh_secret_name(job_name),
                items: Some(secret_items),
                ..Default::default()
            }),
            ..Default::default()
        },
    );

    Volume {
        name: SSH_AUTH_VOLUME.to_string(),
        projected: Some(ProjectedVolumeSource {
            default_mode: Some(0o600),
            sources: Some(sources),
            ..Default::default()
        }),
        ..Default::default()
    }
}
