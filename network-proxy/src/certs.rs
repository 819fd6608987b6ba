use anyhow::Context as _;
use anyhow::Result;
use anyhow::anyhow;
use rcgen::BasicConstraints;
use rcgen::CertificateParams;
use rcgen::DistinguishedName;
use rcgen::DnType;
use rcgen::ExtendedKeyUsagePurpose;
use rcgen::IsCa;
use rcgen::Issuer;
use rcgen::KeyPair;
use rcgen::KeyUsagePurpose;
use rcgen::PKCS_ECDSA_P256_SHA256;
use rcgen::SanType;
use rustls_pki_types::CertificateDer;
use rustls_pki_types::PrivateKeyDer;
use rustls_pki_types::pem::PemObject as _;
use std::collections::HashMap;
use std::fs;
use std::fs::File;
use std::fs::OpenOptions;
use std::io::Write as _;
use std::net::IpAddr;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use time::Duration;
use time::OffsetDateTime;
use tracing::info;

const CA_CERT_FILE: &str = "ca-cert.pem";
const CA_KEY_FILE: &str = "ca-key.pem";
const LEAF_CACHE_DIR: &str = "certs";

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 825;

/// Process-wide certificate authority: a persisted self-signed CA plus an
/// on-disk cache of per-host leaf certificates minted on demand.
#[derive(Debug)]
pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    dir: PathBuf,
    server_configs: Mutex<HashMap<String, Arc<rustls::ServerConfig>>>,
}

impl CertificateAuthority {
    /// Idempotent: loads the CA from `dir` if present, generates and
    /// persists it otherwise.
    pub fn load_or_create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        let (ca_cert_pem, ca_key_pem) = load_or_create_ca(&dir)?;
        let ca_key = KeyPair::from_pem(&ca_key_pem).context("failed to parse CA key")?;
        let issuer: Issuer<'static, KeyPair> =
            Issuer::from_ca_cert_pem(&ca_cert_pem, ca_key).context("failed to parse CA cert")?;
        Ok(Self {
            issuer,
            dir,
            server_configs: Mutex::new(HashMap::new()),
        })
    }

    pub fn ca_cert_path(&self) -> PathBuf {
        self.dir.join(CA_CERT_FILE)
    }

    /// Leaf certificate and key paths for `host`, minting and caching a
    /// fresh pair when none is on disk.
    pub fn cert_for(&self, host: &str) -> Result<(PathBuf, PathBuf)> {
        let cache = self.dir.join(LEAF_CACHE_DIR);
        let safe = sanitize_host(host);
        let cert_path = cache.join(format!("{safe}.pem"));
        let key_path = cache.join(format!("{safe}-key.pem"));
        if cert_path.exists() && key_path.exists() {
            return Ok((cert_path, key_path));
        }

        fs::create_dir_all(&cache)
            .with_context(|| format!("failed to create {}", cache.display()))?;
        let (cert_pem, key_pem) = issue_host_certificate_pem(host, &self.issuer)?;
        write_atomic(&key_path, key_pem.as_bytes(), 0o600)
            .with_context(|| format!("failed to persist {}", key_path.display()))?;
        write_atomic(&cert_path, cert_pem.as_bytes(), 0o644)
            .with_context(|| format!("failed to persist {}", cert_path.display()))?;
        Ok((cert_path, key_path))
    }

    /// rustls server configuration presenting the forged leaf for `host`.
    pub fn server_config_for(&self, host: &str) -> Result<Arc<rustls::ServerConfig>> {
        crate::ensure_crypto_provider();
        {
            let configs = self
                .server_configs
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if let Some(config) = configs.get(host) {
                return Ok(config.clone());
            }
        }

        let (cert_path, key_path) = self.cert_for(host)?;
        let cert_pem = fs::read(&cert_path)
            .with_context(|| format!("failed to read {}", cert_path.display()))?;
        let key_pem = fs::read(&key_path)
            .with_context(|| format!("failed to read {}", key_path.display()))?;
        let cert = CertificateDer::from_pem_slice(&cert_pem)
            .context("failed to parse host cert PEM")?;
        let key =
            PrivateKeyDer::from_pem_slice(&key_pem).context("failed to parse host key PEM")?;
        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .context("failed to build rustls server config")?;
        // The decrypted stream is parsed as HTTP/1.1; never offer h2.
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        let config = Arc::new(config);
        let mut configs = self
            .server_configs
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        configs.insert(host.to_string(), config.clone());
        Ok(config)
    }
}

/// Filesystem-safe transform of a hostname for the leaf cache.
fn sanitize_host(host: &str) -> String {
    host.chars()
        .flat_map(|c| {
            if c == '*' {
                "_wildcard_".chars().collect::<Vec<_>>()
            } else if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                vec![c]
            } else {
                vec!['_']
            }
        })
        .collect()
}

fn load_or_create_ca(dir: &Path) -> Result<(String, String)> {
    let cert_path = dir.join(CA_CERT_FILE);
    let key_path = dir.join(CA_KEY_FILE);

    if cert_path.exists() || key_path.exists() {
        if !cert_path.exists() || !key_path.exists() {
            return Err(anyhow!(
                "both CA files must exist (cert={}, key={})",
                cert_path.display(),
                key_path.display()
            ));
        }
        let cert_pem = fs::read_to_string(&cert_path)
            .with_context(|| format!("failed to read CA cert {}", cert_path.display()))?;
        let key_pem = fs::read_to_string(&key_path)
            .with_context(|| format!("failed to read CA key {}", key_path.display()))?;
        return Ok((cert_pem, key_pem));
    }

    fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let (cert_pem, key_pem) = generate_ca()?;
    write_atomic(&key_path, key_pem.as_bytes(), 0o600)
        .with_context(|| format!("failed to persist CA key {}", key_path.display()))?;
    write_atomic(&cert_path, cert_pem.as_bytes(), 0o644)
        .with_context(|| format!("failed to persist CA cert {}", cert_path.display()))?;

    let cert_display = cert_path.display();
    info!("generated proxy CA certificate at {cert_display}");
    info!(
        "to trust it on macOS run: sudo security add-trusted-cert -d -r trustRoot \
         -k /Library/Keychains/System.keychain {cert_display}"
    );
    Ok((cert_pem, key_pem))
}

fn generate_ca() -> Result<(String, String)> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "WindsurfPromptProxy CA");
    dn.push(DnType::OrganizationName, "WindsurfProxy");
    dn.push(DnType::CountryName, "US");
    params.distinguished_name = dn;
    params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
    params.not_after = OffsetDateTime::now_utc() + Duration::days(CA_VALIDITY_DAYS);

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .context("failed to generate CA key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate CA cert")?;
    Ok((cert.pem(), key_pair.serialize_pem()))
}

fn issue_host_certificate_pem(
    host: &str,
    issuer: &Issuer<'_, KeyPair>,
) -> Result<(String, String)> {
    let mut params = if let Ok(ip) = host.parse::<IpAddr>() {
        let mut params =
            CertificateParams::new(Vec::new()).context("failed to create cert params")?;
        params.subject_alt_names.push(SanType::IpAddress(ip));
        params
    } else {
        CertificateParams::new(vec![host.to_string()])
            .context("failed to create cert params")?
    };

    params.is_ca = IsCa::ExplicitNoCa;
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    params.distinguished_name = dn;
    params.not_before = OffsetDateTime::now_utc() - Duration::days(1);
    params.not_after = OffsetDateTime::now_utc() + Duration::days(LEAF_VALIDITY_DAYS);

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
        .context("failed to generate host key pair")?;
    let cert = params
        .signed_by(&key_pair, issuer)
        .context("failed to sign host cert")?;

    Ok((cert.pem(), key_pair.serialize_pem()))
}

fn write_atomic(path: &Path, contents: &[u8], mode: u32) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| anyhow!("missing parent directory"))?;
    let file_name = path.file_name().unwrap_or_default().to_string_lossy();
    let pid = std::process::id();
    let tmp_path = parent.join(format!(".{file_name}.tmp.{pid}"));

    let mut file = open_with_mode(&tmp_path, mode)?;
    file.write_all(contents)
        .with_context(|| format!("failed to write {}", tmp_path.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to fsync {}", tmp_path.display()))?;
    drop(file);

    // Concurrent minting for the same host is tolerated; last writer wins
    // and both writers produce valid material.
    fs::rename(&tmp_path, path).with_context(|| {
        format!("failed to rename {} -> {}", tmp_path.display(), path.display())
    })?;
    Ok(())
}

#[cfg(unix)]
fn open_with_mode(path: &Path, mode: u32) -> Result<File> {
    use std::os::unix::fs::OpenOptionsExt as _;

    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(mode)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))
}

#[cfg(not(unix))]
fn open_with_mode(path: &Path, _mode: u32) -> Result<File> {
    OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    #[test]
    fn load_or_create_is_idempotent() {
        let dir = tempdir().unwrap();
        let _ca = CertificateAuthority::load_or_create(dir.path()).unwrap();
        let cert_first = fs::read(dir.path().join(CA_CERT_FILE)).unwrap();
        let key_first = fs::read(dir.path().join(CA_KEY_FILE)).unwrap();

        let _ca = CertificateAuthority::load_or_create(dir.path()).unwrap();
        let cert_second = fs::read(dir.path().join(CA_CERT_FILE)).unwrap();
        let key_second = fs::read(dir.path().join(CA_KEY_FILE)).unwrap();

        assert_eq!(cert_first, cert_second);
        assert_eq!(key_first, key_second);
    }

    #[test]
    fn missing_half_of_the_ca_is_an_error() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(CA_CERT_FILE), "cert without key").unwrap();
        let err = CertificateAuthority::load_or_create(dir.path()).unwrap_err();
        assert!(err.to_string().contains("both CA files"));
    }

    #[test]
    fn cert_for_caches_leaf_material() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::load_or_create(dir.path()).unwrap();

        let (cert_path, key_path) = ca.cert_for("api.openai.com").unwrap();
        assert!(cert_path.ends_with("certs/api.openai.com.pem"));
        assert!(key_path.ends_with("certs/api.openai.com-key.pem"));
        let first = fs::read(&cert_path).unwrap();

        let (cert_again, _) = ca.cert_for("api.openai.com").unwrap();
        assert_eq!(cert_again, cert_path);
        assert_eq!(fs::read(&cert_again).unwrap(), first);
    }

    #[test]
    fn leaf_pem_parses_and_builds_a_server_config() {
        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::load_or_create(dir.path()).unwrap();
        let config = ca.server_config_for("api.anthropic.com").unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
        // Second call is served from the in-memory cache.
        let again = ca.server_config_for("api.anthropic.com").unwrap();
        assert!(Arc::ptr_eq(&config, &again));
    }

    #[test]
    fn wildcard_hosts_map_to_a_reserved_token() {
        assert_eq!(sanitize_host("*.openai.com"), "_wildcard_.openai.com");
        assert_eq!(sanitize_host("api.openai.com"), "api.openai.com");
        assert_eq!(sanitize_host("host:443"), "host_443");
    }

    #[cfg(unix)]
    #[test]
    fn key_files_are_not_group_or_world_readable() {
        use std::os::unix::fs::PermissionsExt as _;

        let dir = tempdir().unwrap();
        let ca = CertificateAuthority::load_or_create(dir.path()).unwrap();
        let (_, key_path) = ca.cert_for("api.groq.com").unwrap();

        for path in [dir.path().join(CA_KEY_FILE), key_path] {
            let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode & 0o077, 0, "{} is too permissive: {mode:o}", path.display());
        }
    }
}
