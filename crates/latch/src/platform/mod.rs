//! Host resolver control, one implementation per platform.

#[cfg(target_os = "linux")]
mod linux;

#[cfg(target_os = "macos")]
mod macos;

#[cfg(windows)]
mod windows;

/// Points the host's resolver(s) at loopback and back again. The daemon
/// consumes only the prior upstream returned by `install`, which pre-seeds
/// the forward path.
pub trait SystemDns: Send {
    /// Configure the host resolver to use loopback first. Returns the
    /// previously configured upstream, when one could be determined.
    fn install(&mut self) -> anyhow::Result<Option<String>>;

    /// Revert the host resolver to its pre-install state.
    fn restore(&mut self) -> anyhow::Result<()>;
}

/// The controller for the running platform.
pub fn controller() -> Box<dyn SystemDns> {
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::ResolvConf::new())
    }
    #[cfg(target_os = "macos")]
    {
        Box::new(macos::NetworkSetup::new())
    }
    #[cfg(windows)]
    {
        Box::new(windows::Netsh::new())
    }
    #[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
    {
        Box::new(Unsupported)
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
struct Unsupported;

#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
impl SystemDns for Unsupported {
    fn install(&mut self) -> anyhow::Result<Option<String>> {
        anyhow::bail!("system DNS control is not supported on this platform")
    }

    fn restore(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
