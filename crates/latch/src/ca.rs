//! Root CA management: creation, trust-store install, certificate issuance.
//!
//! The CA lives in `etc/cert/` next to the executable: an ECDSA P-256 key
//! pair and a self-signed root certificate. Leaf certificates are issued
//! either from a CSR or for a set of domain names.

use std::path::{Path, PathBuf};

use anyhow::Context;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateSigningRequestParams, DnType, IsCa, KeyPair,
    KeyUsagePurpose,
};
use time::{Duration, OffsetDateTime};

use crate::truststore;

const ROOT_CERT_FILE: &str = "rootCA.pem";
const ROOT_KEY_FILE: &str = "rootCA-key.pem";

/// Subject CN of the root certificate; also the trust-store entry name.
const ROOT_COMMON_NAME: &str = "Latch Root CA";

/// Trust-store filename stem.
const STORE_NAME: &str = "latch-root-ca";

const CA_VALIDITY_DAYS: i64 = 3_650;
const LEAF_VALIDITY_DAYS: i64 = 825;

/// The loaded (or freshly created) root CA, ready to sign.
pub struct RootCa {
    pub cert_pem: String,
    cert: rcgen::Certificate,
    key: KeyPair,
}

impl std::fmt::Debug for RootCa {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RootCa")
            .field("cert_pem", &self.cert_pem)
            .finish_non_exhaustive()
    }
}

fn ca_dir(home: &Path) -> PathBuf {
    home.join("etc").join("cert")
}

/// Load the root CA from `etc/cert/`, creating it first when
/// `create_missing` is set.
pub fn load_root_ca(home: &Path, create_missing: bool) -> anyhow::Result<RootCa> {
    let dir = ca_dir(home);
    let cert_path = dir.join(ROOT_CERT_FILE);
    let key_path = dir.join(ROOT_KEY_FILE);

    if !cert_path.exists() || !key_path.exists() {
        if !create_missing {
            anyhow::bail!(
                "root CA not found under {}; run `latch install-root-ca` first",
                dir.display()
            );
        }
        return create_root_ca(&dir);
    }

    let cert_pem = std::fs::read_to_string(&cert_path)
        .with_context(|| format!("reading {}", cert_path.display()))?;
    let key_pem = std::fs::read_to_string(&key_path)
        .with_context(|| format!("reading {}", key_path.display()))?;

    let key = KeyPair::from_pem(&key_pem).context("parsing root CA key")?;
    let params =
        CertificateParams::from_ca_cert_pem(&cert_pem).context("parsing root CA certificate")?;
    let cert = params.self_signed(&key).context("rebuilding root CA")?;

    Ok(RootCa {
        cert_pem,
        cert,
        key,
    })
}

fn create_root_ca(dir: &Path) -> anyhow::Result<RootCa> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;

    let key = KeyPair::generate().context("generating root CA key")?;

    let mut params = CertificateParams::default();
    params
        .distinguished_name
        .push(DnType::CommonName, ROOT_COMMON_NAME);
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::CrlSign,
    ];
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = OffsetDateTime::now_utc() + Duration::days(CA_VALIDITY_DAYS);

    let cert = params.self_signed(&key).context("signing root CA")?;
    let cert_pem = cert.pem();

    let cert_path = dir.join(ROOT_CERT_FILE);
    let key_path = dir.join(ROOT_KEY_FILE);
    std::fs::write(&cert_path, &cert_pem)
        .with_context(|| format!("writing {}", cert_path.display()))?;
    std::fs::write(&key_path, key.serialize_pem())
        .with_context(|| format!("writing {}", key_path.display()))?;

    tracing::info!(path = %cert_path.display(), "root CA created");
    Ok(RootCa {
        cert_pem,
        cert,
        key,
    })
}

/// Create (when asked) and install the root CA into the system trust store.
pub fn install(home: &Path, ensure_file: bool) -> anyhow::Result<()> {
    let ca = load_root_ca(home, ensure_file)?;
    truststore::install_ca_cert(&ca.cert_pem, STORE_NAME)
        .context("installing root CA into the system trust store")?;
    Ok(())
}

/// Remove the root CA from the system trust store. The files under
/// `etc/cert/` are kept.
pub fn uninstall(home: &Path) -> anyhow::Result<()> {
    let _ = home;
    truststore::uninstall_ca_cert(ROOT_COMMON_NAME, STORE_NAME)
        .context("removing root CA from the system trust store")?;
    Ok(())
}

/// Issue a leaf certificate signed by the root CA, either from a CSR file
/// or for space-separated domain names. Outputs land in `out_dir`.
pub fn create_cert(
    home: &Path,
    out_dir: &Path,
    csr_file: Option<&Path>,
    domain_name: Option<&str>,
) -> anyhow::Result<()> {
    let ca = load_root_ca(home, false)?;

    if let Some(csr_path) = csr_file {
        let csr_pem = std::fs::read_to_string(csr_path)
            .with_context(|| format!("reading {}", csr_path.display()))?;
        let csr = CertificateSigningRequestParams::from_pem(&csr_pem).context("parsing CSR")?;
        let cert = csr
            .signed_by(&ca.cert, &ca.key)
            .context("signing certificate from CSR")?;

        let stem = csr_path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "cert".to_string());
        let out = out_dir.join(format!("{stem}.pem"));
        std::fs::write(&out, cert.pem()).with_context(|| format!("writing {}", out.display()))?;
        tracing::info!(path = %out.display(), "certificate issued from CSR");
        return Ok(());
    }

    let raw = domain_name.unwrap_or_default();
    let domains: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
    if domains.is_empty() {
        anyhow::bail!("no domain names given");
    }

    let leaf_key = KeyPair::generate().context("generating certificate key")?;
    let mut params =
        CertificateParams::new(domains.clone()).context("building certificate parameters")?;
    params
        .distinguished_name
        .push(DnType::CommonName, domains[0].clone());
    params.not_before = OffsetDateTime::now_utc();
    params.not_after = OffsetDateTime::now_utc() + Duration::days(LEAF_VALIDITY_DAYS);

    let cert = params
        .signed_by(&leaf_key, &ca.cert, &ca.key)
        .context("signing certificate")?;

    let stem = domains[0].replace('*', "_wildcard");
    let cert_out = out_dir.join(format!("{stem}.pem"));
    let key_out = out_dir.join(format!("{stem}-key.pem"));
    std::fs::write(&cert_out, cert.pem())
        .with_context(|| format!("writing {}", cert_out.display()))?;
    std::fs::write(&key_out, leaf_key.serialize_pem())
        .with_context(|| format!("writing {}", key_out.display()))?;

    tracing::info!(cert = %cert_out.display(), key = %key_out.display(), "certificate issued");
    Ok(())
}
