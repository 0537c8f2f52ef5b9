use clap::{ArgGroup, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "latch",
    version,
    about = "Local DNS proxy gating a reserved pseudo-TLD behind knock authorization"
)]
pub struct Cli {
    /// Log level override (0=silent 1=error 2=info 3=audit 4=debug 5=trace);
    /// defaults to the config file value
    #[arg(long, env = "LATCH_LOG_LEVEL", global = true)]
    pub log_level: Option<i64>,

    /// Directory holding etc/ (default: the executable's directory)
    #[arg(long, env = "LATCH_HOME", value_name = "DIR", global = true)]
    pub home: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Create and run the local DNS proxy service (the default)
    #[command(visible_alias = "r")]
    Run,

    /// Install the root CA into the system trust store
    #[command(name = "install-root-ca", visible_alias = "i")]
    InstallRootCa {
        /// Create the root CA files when they do not exist yet
        #[arg(long, short = 'e', default_value_t = true, action = clap::ArgAction::Set, value_name = "BOOL")]
        ensure_file: bool,
    },

    /// Remove the root CA from the system trust store
    #[command(name = "uninstall-root-ca", visible_alias = "u")]
    UninstallRootCa,

    /// Issue a certificate from a CSR file or for a domain name
    #[command(name = "create-cert", visible_alias = "c")]
    #[command(group(ArgGroup::new("source").required(true).multiple(false)))]
    CreateCert {
        /// Path to a PEM-encoded CSR file
        #[arg(long, short = 'f', value_name = "PATH", group = "source")]
        csr_file: Option<PathBuf>,

        /// Domain name(s) to certify, space separated
        #[arg(long, short = 'd', value_name = "NAME", group = "source")]
        domain_name: Option<String>,
    },
}
