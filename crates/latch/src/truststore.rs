//! Platform trust store integration for the Latch root CA.
//!
//! Platform support:
//! - **Linux**: copies to `/usr/local/share/ca-certificates/` and runs
//!   `update-ca-certificates`
//! - **macOS**: `security add-trusted-cert` with the System keychain
//! - **Windows**: `certutil -addstore Root`

use std::process::Command;

#[derive(Debug, thiserror::Error)]
pub enum TrustStoreError {
    #[error("trust store command failed: {0}")]
    CommandFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("platform not supported")]
    Unsupported,
}

#[cfg(target_os = "linux")]
const CA_CERTS_DIR: &str = "/usr/local/share/ca-certificates";

/// Install a PEM-encoded CA certificate into the OS trust store. `name`
/// forms the stored filename. Typically requires elevated privileges;
/// errors are non-fatal and callers warn and continue.
pub fn install_ca_cert(cert_pem: &str, name: &str) -> Result<(), TrustStoreError> {
    #[cfg(target_os = "linux")]
    {
        let cert_path = std::path::Path::new(CA_CERTS_DIR).join(format!("{name}.crt"));
        std::fs::write(&cert_path, cert_pem)?;
        let output = Command::new("update-ca-certificates").output()?;
        check(output, "update-ca-certificates")?;
        tracing::info!(name, path = %cert_path.display(), "root CA installed in system trust store");
        Ok(())
    }
    #[cfg(target_os = "macos")]
    {
        let cert_path = std::env::temp_dir().join(format!("{name}.crt"));
        std::fs::write(&cert_path, cert_pem)?;
        let output = Command::new("security")
            .args([
                "add-trusted-cert",
                "-d",
                "-r",
                "trustRoot",
                "-k",
                "/Library/Keychains/System.keychain",
                &cert_path.to_string_lossy(),
            ])
            .output()?;
        let _ = std::fs::remove_file(&cert_path);
        check(output, "security add-trusted-cert")?;
        tracing::info!(name, "root CA installed in macOS System Keychain");
        Ok(())
    }
    #[cfg(windows)]
    {
        let cert_path = std::env::temp_dir().join(format!("{name}.crt"));
        std::fs::write(&cert_path, cert_pem)?;
        let output = Command::new("certutil")
            .args(["-addstore", "Root", &cert_path.to_string_lossy()])
            .output()?;
        let _ = std::fs::remove_file(&cert_path);
        check(output, "certutil -addstore")?;
        tracing::info!(name, "root CA installed in Windows certificate store");
        Ok(())
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        let _ = (cert_pem, name);
        Err(TrustStoreError::Unsupported)
    }
}

/// Remove a previously installed CA certificate from the OS trust store.
/// `common_name` is the certificate subject CN (used on macOS/Windows).
pub fn uninstall_ca_cert(common_name: &str, name: &str) -> Result<(), TrustStoreError> {
    #[cfg(target_os = "linux")]
    {
        let _ = common_name;
        let cert_path = std::path::Path::new(CA_CERTS_DIR).join(format!("{name}.crt"));
        if cert_path.exists() {
            std::fs::remove_file(&cert_path)?;
        }
        let output = Command::new("update-ca-certificates").arg("--fresh").output()?;
        check(output, "update-ca-certificates --fresh")?;
        tracing::info!(name, "root CA removed from system trust store");
        Ok(())
    }
    #[cfg(target_os = "macos")]
    {
        let _ = name;
        let output = Command::new("security")
            .args([
                "delete-certificate",
                "-c",
                common_name,
                "/Library/Keychains/System.keychain",
            ])
            .output()?;
        check(output, "security delete-certificate")?;
        tracing::info!(common_name, "root CA removed from macOS System Keychain");
        Ok(())
    }
    #[cfg(windows)]
    {
        let _ = name;
        let output = Command::new("certutil")
            .args(["-delstore", "Root", common_name])
            .output()?;
        check(output, "certutil -delstore")?;
        tracing::info!(common_name, "root CA removed from Windows certificate store");
        Ok(())
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        let _ = (common_name, name);
        Err(TrustStoreError::Unsupported)
    }
}

#[allow(dead_code)]
fn check(output: std::process::Output, what: &str) -> Result<(), TrustStoreError> {
    if output.status.success() {
        Ok(())
    } else {
        let stderr = String::from_utf8_lossy(&output.stderr);
        Err(TrustStoreError::CommandFailed(format!(
            "{what} exit code {}: {}",
            output.status.code().unwrap_or(-1),
            stderr.trim()
        )))
    }
}
