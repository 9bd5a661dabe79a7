//! cluster-pki CLI application.
//!
//! Operator tool for the cluster PKI: bring up a CA, sign and revoke
//! certificates, generate CSRs and inspect certificate or identity files.

use clap::{Parser, Subcommand};
use cluster_pki::ca::{CertificateAuthority, RevocationReason};
use cluster_pki::cert::chain::{CertRole, CertificateExt, SerialId};
use cluster_pki::cert::codec;
use cluster_pki::cert::csr::build_csr;
use cluster_pki::cert::x509_signing::dns_name;
use cluster_pki::config::{IdentityLayout, SecurityConfig};
use cluster_pki::crypto::ed25519::{generate_ed25519_keypair, private_key_to_pem};
use cluster_pki::error::{PkiError, Result};
use cluster_pki::storage::cert_storage::write_restricted;
use cluster_pki::storage::keystore::KeyFiles;
use cluster_pki::storage::metadata::IdentityRecord;
use cluster_pki::storage::trusted::TrustedCertStorage;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_subscriber::EnvFilter;
use x509_cert::time::Time;

#[derive(Parser)]
#[command(name = "cluster-pki")]
#[command(about = "Certificate lifecycle management for cluster node identities", long_about = None)]
struct Cli {
    /// Security configuration file (TOML); defaults apply when absent
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Certificate authority operations
    #[command(subcommand)]
    Ca(CaCommands),

    /// Certificate signing requests
    #[command(subcommand)]
    Csr(CsrCommands),

    /// Certificate file operations
    #[command(subcommand)]
    Cert(CertCommands),

    /// Component identity operations
    #[command(subcommand)]
    Client(ClientCommands),
}

#[derive(Subcommand)]
enum CaCommands {
    /// Bootstrap the root CA (self-signed, or imported when configured)
    Init {
        /// Root certificate subject (e.g., "CN=Cluster Root CA,O=Example")
        #[arg(long, default_value = "CN=Cluster Root CA")]
        subject: String,
    },

    /// Sign a CSR with the root CA
    Sign {
        /// CSR file (PEM)
        #[arg(long)]
        csr: PathBuf,

        /// Role of the issued certificate: leaf or subordinate
        #[arg(long, default_value = "leaf")]
        role: CertRole,

        /// Validity in days (defaults to the configured certificate duration)
        #[arg(long)]
        validity_days: Option<u64>,

        /// Output chain file
        #[arg(long)]
        output: PathBuf,
    },

    /// Revoke an issued certificate
    Revoke {
        /// Serial number (decimal)
        #[arg(long)]
        serial: SerialId,

        /// Reason, e.g. key_compromise or superseded
        #[arg(long, default_value = "unspecified")]
        reason: String,
    },
}

#[derive(Subcommand)]
enum CsrCommands {
    /// Generate a key pair and a CSR for it
    Generate {
        /// Certificate subject
        #[arg(long)]
        subject: String,

        /// Requested role: leaf or subordinate
        #[arg(long, default_value = "leaf")]
        role: CertRole,

        /// DNS alternative names
        #[arg(long)]
        dns: Vec<String>,

        /// Output private key file (PKCS#8 PEM)
        #[arg(long)]
        key_out: PathBuf,

        /// Output CSR file
        #[arg(long)]
        csr_out: PathBuf,
    },
}

#[derive(Subcommand)]
enum CertCommands {
    /// Print the certificates of a PEM file
    Inspect {
        /// Certificate or chain file
        #[arg(long)]
        file: PathBuf,
    },
}

#[derive(Subcommand)]
enum ClientCommands {
    /// Show the identity state of a component
    Status {
        /// Component name
        #[arg(long)]
        component: String,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Ca(cmd) => handle_ca_command(&config, cmd),
        Commands::Csr(cmd) => handle_csr_command(cmd),
        Commands::Cert(cmd) => handle_cert_command(cmd),
        Commands::Client(cmd) => handle_client_command(&config, cmd),
    }
}

fn load_config(path: Option<&Path>) -> Result<SecurityConfig> {
    let config = match path {
        Some(path) => SecurityConfig::from_toml_file(path)?,
        None => SecurityConfig::default(),
    };
    config.validate()?;
    Ok(config)
}

fn handle_ca_command(config: &SecurityConfig, cmd: CaCommands) -> Result<()> {
    match cmd {
        CaCommands::Init { subject } => {
            let ca = CertificateAuthority::bootstrap_root(config, &subject)?;
            let root = ca.root_certificate();
            println!("Root CA ready: {}", root.subject_name());
            println!("Serial: {}", root.serial_id());
            println!(
                "Valid until: {}",
                format_time(&root.tbs_certificate.validity.not_after)
            );
            Ok(())
        }

        CaCommands::Sign {
            csr,
            role,
            validity_days,
            output,
        } => {
            let ca = CertificateAuthority::bootstrap_root(config, "CN=Cluster Root CA")?;
            let csr_pem = fs::read_to_string(&csr)?;
            let validity = validity_days
                .map(|days| Duration::from_secs(days.saturating_mul(86400)))
                .unwrap_or_else(|| config.default_certificate_duration());

            let chain = ca.issue_chain(&csr_pem, validity, role)?;
            write_restricted(&output, &codec::encode(&chain)?)?;

            println!(
                "Issued {} certificate {} for {}",
                role,
                chain.leaf().serial_id(),
                chain.leaf().subject_name()
            );
            println!("Chain written to: {}", output.display());
            Ok(())
        }

        CaCommands::Revoke { serial, reason } => {
            let reason: RevocationReason = serde_json::from_value(serde_json::Value::String(
                reason.clone(),
            ))
            .map_err(|_| PkiError::Config(format!("Unknown revocation reason: '{}'", reason)))?;
            let ca = CertificateAuthority::bootstrap_root(config, "CN=Cluster Root CA")?;
            let entry = ca.revoke(&serial, reason)?;

            println!("Revoked {} ({})", entry.serial, entry.reason);
            println!("CRL number: {}", ca.crl().crl_number);
            Ok(())
        }
    }
}

fn handle_csr_command(cmd: CsrCommands) -> Result<()> {
    match cmd {
        CsrCommands::Generate {
            subject,
            role,
            dns,
            key_out,
            csr_out,
        } => {
            let keypair = generate_ed25519_keypair()?;
            let alt_names = dns
                .iter()
                .map(|name| dns_name(name))
                .collect::<Result<Vec<_>>>()?;
            let csr = build_csr(&keypair, &subject, role, &alt_names)?;

            write_restricted(&key_out, &private_key_to_pem(&keypair.secret)?)?;
            write_restricted(&csr_out, &csr)?;

            println!("Private key written to: {}", key_out.display());
            println!("CSR written to: {}", csr_out.display());
            println!("Public key: {}", hex::encode(keypair.public_bytes()));
            Ok(())
        }
    }
}

fn handle_cert_command(cmd: CertCommands) -> Result<()> {
    match cmd {
        CertCommands::Inspect { file } => {
            let chain = codec::decode(&fs::read_to_string(&file)?)?;
            for (index, cert) in chain.iter().enumerate() {
                let validity = &cert.tbs_certificate.validity;
                println!("[{}] {}", index, cert.subject_name());
                println!("    Serial:     {}", cert.serial_id());
                println!("    Role:       {}", cert.role());
                println!("    Issuer:     {}", cert.issuer_name());
                println!("    Not before: {}", format_time(&validity.not_before));
                println!("    Not after:  {}", format_time(&validity.not_after));
                if let Ok(key) = cert.public_key() {
                    println!("    Public key: {}", hex::encode(key.as_bytes()));
                }
            }
            match chain.validate_links() {
                Ok(()) => println!("Chain links: ok"),
                Err(e) => println!("Chain links: {}", e),
            }
            Ok(())
        }
    }
}

fn handle_client_command(config: &SecurityConfig, cmd: ClientCommands) -> Result<()> {
    match cmd {
        ClientCommands::Status { component } => {
            let layout = IdentityLayout::for_component(config, &component);
            let dir = &layout.identity_dir;
            let keys = KeyFiles::in_dir(&layout, dir);

            println!("Identity directory: {}", dir.display());
            println!(
                "Private key: {}",
                presence(keys.read_private_key().map(|k| k.is_some()))
            );
            println!(
                "Public key:  {}",
                presence(keys.read_public_key().map(|k| k.is_some()))
            );

            match codec::decode(&fs::read_to_string(layout.certificate_path(dir)).unwrap_or_default())
            {
                Ok(chain) => {
                    let leaf = chain.leaf();
                    println!("Certificate: {} ({})", leaf.serial_id(), leaf.subject_name());
                    println!(
                        "Not after:   {}",
                        format_time(&leaf.tbs_certificate.validity.not_after)
                    );
                    let grace_start = leaf
                        .not_after()
                        .checked_sub(config.renewal_grace_period())
                        .unwrap_or(SystemTime::UNIX_EPOCH);
                    match grace_start.duration_since(SystemTime::now()) {
                        Ok(remaining) => {
                            println!("Renewal due in: {}s", remaining.as_secs())
                        }
                        Err(_) => println!("Renewal due: now"),
                    }
                }
                Err(_) => println!("Certificate: missing or unreadable"),
            }

            if let Some(record) = IdentityRecord::load(&layout.record_path(dir))? {
                println!("Recorded serial: {}", record.cert_serial_id);
            }
            println!(
                "Backup present: {}",
                layout.certificate_path(&layout.backup_dir).is_file()
            );

            let trust = TrustedCertStorage::new(&layout.trust_dir).load()?;
            println!(
                "Trusted: {} root(s), {} subordinate(s)",
                trust.roots().count(),
                trust.subordinates().count()
            );
            Ok(())
        }
    }
}

fn format_time(time: &Time) -> String {
    time.to_date_time().to_string()
}

fn presence(state: Result<bool>) -> String {
    match state {
        Ok(true) => "present".to_string(),
        Ok(false) => "missing".to_string(),
        Err(e) => format!("unreadable ({})", e),
    }
}
