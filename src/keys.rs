use std::{fs, path::Path};

use color_eyre::eyre::{Context, eyre};
use russh::keys::{
    PrivateKey, PublicKey, load_secret_key,
    ssh_key::{
        EcdsaCurve, LineEnding,
        private::{Ed25519Keypair, EcdsaKeypair, KeypairData, RsaKeypair},
        rand_core::OsRng,
    },
};
use tracing::{info, warn};

/// Host-key algorithms the server can offer, each tied to its own key file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyAlgorithm {
    Rsa,
    Ecdsa,
    Ed25519,
}

/// Load the host key at `path`, generating and persisting a fresh one if
/// the file does not exist. Generated keys are written in OpenSSH PEM with
/// mode 0600.
pub fn load_or_generate_host_key(
    path: &Path,
    algorithm: HostKeyAlgorithm,
) -> color_eyre::Result<PrivateKey> {
    if path.exists() {
        return load_secret_key(path, None)
            .with_context(|| format!("Error loading host key {}", path.display()));
    }
    info!(path = %path.display(), ?algorithm, "Host key not found. Generating...");
    let pair = match algorithm {
        HostKeyAlgorithm::Rsa => KeypairData::from(
            RsaKeypair::random(&mut OsRng, 4096)
                .map_err(|error| eyre!("Error generating RSA key: {error}"))?,
        ),
        HostKeyAlgorithm::Ecdsa => KeypairData::from(
            EcdsaKeypair::random(&mut OsRng, EcdsaCurve::NistP256)
                .map_err(|error| eyre!("Error generating ECDSA key: {error}"))?,
        ),
        HostKeyAlgorithm::Ed25519 => KeypairData::from(Ed25519Keypair::random(&mut OsRng)),
    };
    let key = PrivateKey::new(pair, "")
        .map_err(|error| eyre!("Error assembling private key: {error}"))?;
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)
            .with_context(|| format!("Error creating key directory {}", parent.display()))?;
    }
    let encoded = key
        .to_openssh(LineEnding::LF)
        .map_err(|error| eyre!("Error encoding private key: {error}"))?;
    fs::write(path, encoded.as_bytes())
        .with_context(|| format!("Error saving host key {}", path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Error setting permissions on {}", path.display()))?;
    }
    Ok(key)
}

/// Parse an OpenSSH authorized-keys file. Lines that fail to parse are
/// skipped with a warning; an empty result is an error.
pub fn load_authorized_keys(path: &Path) -> color_eyre::Result<Vec<PublicKey>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Error reading authorized keys {}", path.display()))?;
    let keys: Vec<PublicKey> = data
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| match PublicKey::from_openssh(line) {
            Ok(key) => Some(key),
            Err(error) => {
                warn!(%error, "Unable to parse authorized key line.");
                None
            }
        })
        .collect();
    if keys.is_empty() {
        return Err(eyre!("no usable keys in {}", path.display()));
    }
    Ok(keys)
}

/// Parse the expected server host keys for strict verification. Accepts
/// plain public-key lines as well as known_hosts lines with a leading host
/// field.
pub fn load_known_host_keys(path: &Path) -> color_eyre::Result<Vec<PublicKey>> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Error reading host key file {}", path.display()))?;
    let keys: Vec<PublicKey> = data
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            PublicKey::from_openssh(line).ok().or_else(|| {
                line.split_once(char::is_whitespace)
                    .and_then(|(_, rest)| PublicKey::from_openssh(rest.trim()).ok())
            })
        })
        .collect();
    if keys.is_empty() {
        return Err(eyre!("no usable keys in {}", path.display()));
    }
    Ok(keys)
}

#[cfg(test)]
mod key_tests {
    use russh::keys::HashAlg;

    use super::{
        HostKeyAlgorithm, load_authorized_keys, load_known_host_keys, load_or_generate_host_key,
    };

    #[test]
    fn generates_and_reloads_ed25519_host_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("host_ed25519");
        let generated = load_or_generate_host_key(&path, HostKeyAlgorithm::Ed25519).unwrap();
        assert!(path.exists());
        let reloaded = load_or_generate_host_key(&path, HostKeyAlgorithm::Ed25519).unwrap();
        assert_eq!(
            generated.public_key().fingerprint(HashAlg::Sha256),
            reloaded.public_key().fingerprint(HashAlg::Sha256)
        );
    }

    #[test]
    fn generates_ecdsa_host_key() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_ecdsa");
        let key = load_or_generate_host_key(&path, HostKeyAlgorithm::Ecdsa).unwrap();
        assert_eq!(key.algorithm().to_string(), "ecdsa-sha2-nistp256");
    }

    #[cfg(unix)]
    #[test]
    fn generated_keys_are_owner_readable_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host_ed25519");
        load_or_generate_host_key(&path, HostKeyAlgorithm::Ed25519).unwrap();
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn parses_authorized_keys_and_skips_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let key = load_or_generate_host_key(
            &dir.path().join("client_key"),
            HostKeyAlgorithm::Ed25519,
        )
        .unwrap();
        let public = key.public_key().to_openssh().unwrap();
        let path = dir.path().join("authorized_keys");
        std::fs::write(&path, format!("# comment\nnot a key\n{public}\n")).unwrap();
        let keys = load_authorized_keys(&path).unwrap();
        assert_eq!(keys.len(), 1);
    }

    #[test]
    fn empty_authorized_keys_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("authorized_keys");
        std::fs::write(&path, "# nothing here\n").unwrap();
        assert!(load_authorized_keys(&path).is_err());
    }

    #[test]
    fn known_host_keys_accept_a_leading_host_field() {
        let dir = tempfile::tempdir().unwrap();
        let key = load_or_generate_host_key(
            &dir.path().join("server_key"),
            HostKeyAlgorithm::Ed25519,
        )
        .unwrap();
        let public = key.public_key().to_openssh().unwrap();
        let path = dir.path().join("known_hosts");
        std::fs::write(&path, format!("example.com {public}\n")).unwrap();
        let keys = load_known_host_keys(&path).unwrap();
        assert_eq!(keys.len(), 1);
    }
}
