//! `qupd-pkg` - release tooling for qupd.
//!
//! Generates key material, seals update packages, writes release
//! manifests, signs packaged archives and records the main-process hash
//! of a build.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use flate2::Compression;
use flate2::write::GzEncoder;
use qupd_core::archive::{DEFAULT_ARCHIVE_EXTENSION, SignerKeyLookup, find_archives};
use qupd_core::envelope::PackageSealer;
use qupd_core::host::HostBuild;
use qupd_core::integrity::{compute_hash_from_roots, default_roots};
use qupd_core::keys::{self, PemKeyPair, RSA_KEY_BITS};
use qupd_schema::manifest::parse_timestamp;
use qupd_schema::{PackageMetadata, ReleaseManifest, Sha256Digest, coerce_version};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "qupd-pkg")]
#[command(author, version, about = "qupd release tooling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a keypair set. Existing keys are never overwritten.
    Keygen {
        #[arg(value_enum)]
        kind: KeyKind,
        /// Output directory
        #[arg(long, default_value = "resources/security")]
        out: PathBuf,
        /// RSA modulus size (update keys only)
        #[arg(long, default_value_t = RSA_KEY_BITS)]
        bits: usize,
    },
    /// Seal a payload into an update package
    Pack {
        /// Payload: a directory (archived as dist/) or a ready .tar.gz
        #[arg(long)]
        input: PathBuf,
        /// Product version recorded in the package
        #[arg(long)]
        version: String,
        /// Directory holding update_enc_pub.pem and update_sign_privkey.pem
        #[arg(long, default_value = "keys")]
        keys: PathBuf,
        /// Main-process hash the host must match
        #[arg(long, value_name = "SHA256")]
        required_main_hash: Option<String>,
        /// Extra metadata as a JSON object (forces format v2)
        #[arg(long, value_name = "JSON")]
        metadata: Option<String>,
        /// Output package file
        #[arg(long)]
        out: PathBuf,
    },
    /// Write the release manifest for an asset
    Manifest {
        /// The published asset
        #[arg(long)]
        asset: PathBuf,
        /// Release version
        #[arg(long)]
        version: String,
        /// Precomputed sha256 of the asset
        #[arg(long, value_name = "SHA256")]
        sha256: Option<String>,
        /// Main-process hash the host must match
        #[arg(long, value_name = "SHA256")]
        required_main_hash: Option<String>,
        /// Release timestamp (defaults to now)
        #[arg(long, value_name = "ISO8601")]
        created_at: Option<String>,
        /// Output manifest file
        #[arg(long, default_value = "latest.yml")]
        out: PathBuf,
    },
    /// Write detached Ed25519 signatures for packaged archives
    SignArchive {
        /// Archives to sign
        paths: Vec<PathBuf>,
        /// Also sign every archive found under this directory
        #[arg(long, value_name = "DIR")]
        scan: Option<PathBuf>,
        /// Archive extension used with --scan
        #[arg(long, default_value = DEFAULT_ARCHIVE_EXTENSION)]
        ext: String,
        /// Private key PEM, used when no key is set in the environment
        #[arg(long, value_name = "PEM")]
        key: Option<PathBuf>,
        /// Generate or reuse a development keypair if no key is configured
        #[arg(long)]
        generate_dev_key: bool,
        /// Where the development keypair lives
        #[arg(long, default_value = "resources/security")]
        dev_key_dir: PathBuf,
    },
    /// Compute the main-process hash, optionally recording it in build-info.json
    MainHash {
        /// Project directory
        #[arg(long, default_value = ".")]
        project: PathBuf,
        /// Hash these roots instead of the project defaults
        #[arg(long = "root", value_name = "DIR")]
        roots: Vec<PathBuf>,
        /// Resource directory to write build-info.json into
        #[arg(long, value_name = "DIR")]
        write: Option<PathBuf>,
        /// Host version, required when build-info.json does not exist yet
        #[arg(long)]
        version: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum KeyKind {
    /// RSA signing and content-key pairs
    Update,
    /// Ed25519 archive signing pair
    Archive,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Commands::Keygen { kind, out, bits } => keygen(kind, &out, bits),
        Commands::Pack {
            input,
            version,
            keys,
            required_main_hash,
            metadata,
            out,
        } => pack(
            &input,
            &version,
            &keys,
            required_main_hash.as_deref(),
            metadata.as_deref(),
            &out,
        ),
        Commands::Manifest {
            asset,
            version,
            sha256,
            required_main_hash,
            created_at,
            out,
        } => manifest(
            &asset,
            &version,
            sha256.as_deref(),
            required_main_hash.as_deref(),
            created_at.as_deref(),
            &out,
        ),
        Commands::SignArchive {
            paths,
            scan,
            ext,
            key,
            generate_dev_key,
            dev_key_dir,
        } => sign_archive(
            paths,
            scan.as_deref(),
            &ext,
            key,
            generate_dev_key,
            dev_key_dir,
        ),
        Commands::MainHash {
            project,
            roots,
            write,
            version,
        } => main_hash(&project, roots, write.as_deref(), version.as_deref()),
    }
}

fn keygen(kind: KeyKind, out: &Path, bits: usize) -> Result<()> {
    match kind {
        KeyKind::Update => {
            let signing = PemKeyPair::generate_rsa(bits)?;
            let content = PemKeyPair::generate_rsa(bits)?;
            let (sign_pub, sign_priv) = signing.write_to(
                out,
                keys::UPDATE_SIGN_PUBLIC_KEY,
                keys::UPDATE_SIGN_PRIVATE_KEY,
            )?;
            let (enc_pub, enc_priv) = content.write_to(
                out,
                keys::UPDATE_ENCRYPT_PUBLIC_KEY,
                keys::UPDATE_PRIVATE_KEY,
            )?;
            println!("Generated {bits}-bit update keys in {}", out.display());
            println!("  ship with the app   {}", sign_pub.display());
            println!("  ship with the app   {}", enc_priv.display());
            println!("  keep for releases   {}", sign_priv.display());
            println!("  keep for releases   {}", enc_pub.display());
        }
        KeyKind::Archive => {
            let (public, private) = PemKeyPair::generate_ed25519()?.write_to(
                out,
                keys::ARCHIVE_PUBLIC_KEY,
                keys::ARCHIVE_PRIVATE_KEY,
            )?;
            println!("Generated archive signing keys in {}", out.display());
            println!("  ship with the app   {}", public.display());
            println!("  keep for releases   {}", private.display());
        }
    }
    Ok(())
}

/// Gzip-tar `dir` under a top-level `dist/` directory.
fn archive_dir(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    builder
        .append_dir_all("dist", dir)
        .with_context(|| format!("Failed to archive {}", dir.display()))?;
    Ok(builder.into_inner()?.finish()?)
}

fn pack(
    input: &Path,
    version: &str,
    key_dir: &Path,
    required_main_hash: Option<&str>,
    metadata: Option<&str>,
    out: &Path,
) -> Result<()> {
    if coerce_version(version).is_none() {
        bail!("Version '{version}' is not a valid release version");
    }

    let payload = if input.is_dir() {
        archive_dir(input)?
    } else {
        std::fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?
    };

    let mut meta = match metadata {
        Some(raw) => {
            let value: serde_json::Value =
                serde_json::from_str(raw).context("--metadata is not valid JSON")?;
            if !value.is_object() {
                bail!("--metadata must be a JSON object");
            }
            Some(value)
        }
        None => None,
    };
    if let Some(hash) = required_main_hash {
        let hash = Sha256Digest::new(hash).context("Invalid --required-main-hash")?;
        meta.get_or_insert_with(|| serde_json::json!({}))[PackageMetadata::REQUIRED_MAIN_HASH] =
            serde_json::Value::String(hash.to_string());
    }
    if let Some(obj) = meta.as_mut().and_then(serde_json::Value::as_object_mut) {
        obj.entry(PackageMetadata::CREATED_AT)
            .or_insert_with(|| serde_json::Value::String(Utc::now().to_rfc3339()));
    }

    let sealer = PackageSealer::from_pem(
        &keys::read_pem(&key_dir.join(keys::UPDATE_ENCRYPT_PUBLIC_KEY))?,
        &keys::read_pem(&key_dir.join(keys::UPDATE_SIGN_PRIVATE_KEY))?,
    )?;
    let bytes = sealer.seal(&payload, version, meta.map(PackageMetadata::from_value))?;

    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(out, &bytes).with_context(|| format!("Failed to write {}", out.display()))?;
    info!(version, bytes = bytes.len(), "sealed update package");

    println!("  packed {} ({} bytes)", out.display(), bytes.len());
    println!("  sha256 {}", Sha256Digest::compute(&bytes));
    Ok(())
}

fn manifest(
    asset: &Path,
    version: &str,
    sha256: Option<&str>,
    required_main_hash: Option<&str>,
    created_at: Option<&str>,
    out: &Path,
) -> Result<()> {
    let asset_name = asset
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", asset.display()))?;
    let asset_size = std::fs::metadata(asset)
        .with_context(|| format!("Failed to stat {}", asset.display()))?
        .len();
    let asset_sha256 = match sha256 {
        Some(hash) => Sha256Digest::new(hash).context("Invalid --sha256")?,
        None => Sha256Digest::compute_file(asset)
            .with_context(|| format!("Failed to hash {}", asset.display()))?,
    };
    let created_at: DateTime<Utc> = match created_at {
        Some(raw) => parse_timestamp(raw).with_context(|| format!("Invalid --created-at '{raw}'"))?,
        None => Utc::now(),
    };
    let required_main_hash = required_main_hash
        .map(Sha256Digest::new)
        .transpose()
        .context("Invalid --required-main-hash")?;

    let manifest = ReleaseManifest {
        version: version.to_string(),
        asset_name,
        asset_size,
        asset_sha256,
        required_main_hash,
        created_at,
    };
    let rendered = manifest.render();
    // Refuse to publish something the client would reject
    ReleaseManifest::parse_and_validate(&rendered).context("Generated manifest is invalid")?;

    std::fs::write(out, rendered).with_context(|| format!("Failed to write {}", out.display()))?;
    println!("  wrote {} for {} {}", out.display(), manifest.asset_name, manifest.version);
    Ok(())
}

fn sign_archive(
    mut paths: Vec<PathBuf>,
    scan: Option<&Path>,
    extension: &str,
    key: Option<PathBuf>,
    generate_dev_key: bool,
    dev_key_dir: PathBuf,
) -> Result<()> {
    if let Some(dir) = scan {
        paths.extend(find_archives(dir, extension));
    }
    paths.sort();
    paths.dedup();
    if paths.is_empty() {
        bail!("Nothing to sign. Pass archive paths or --scan DIR.");
    }

    let mut lookup = SignerKeyLookup::from_env(dev_key_dir, generate_dev_key);
    if lookup.path.is_none() {
        lookup.path = key;
    }
    let signer = lookup.resolve().context(
        "No archive signing key. Set QUPD_ARCHIVE_PRIVKEY_PEM or QUPD_ARCHIVE_PRIVKEY_PATH, \
         pass --key, or use --generate-dev-key for local builds.",
    )?;

    for path in &paths {
        let sig = signer.sign(path)?;
        println!("  signed {}", sig.display());
    }
    println!("Signed {} archive(s)", paths.len());
    Ok(())
}

fn main_hash(
    project: &Path,
    roots: Vec<PathBuf>,
    write: Option<&Path>,
    version: Option<&str>,
) -> Result<()> {
    let roots = if roots.is_empty() {
        default_roots(project)
    } else {
        roots
    };
    let hash = compute_hash_from_roots(&roots, project).context("Failed to hash main-process files")?;
    match &hash {
        Some(hash) => println!("{hash}"),
        None => eprintln!("warning: no main-process files found, hash unavailable"),
    }

    let Some(resource_dir) = write else {
        return Ok(());
    };
    let mut host = match version {
        Some(raw) => {
            let version = coerce_version(raw)
                .with_context(|| format!("Version '{raw}' is not a valid release version"))?;
            HostBuild::new(version)
        }
        None => HostBuild::load(resource_dir)
            .context("No build-info.json yet. Pass --version to create one.")?,
    };
    host.main_hash = hash;
    host.build_time = Some(Utc::now());
    host.save(resource_dir)?;
    println!(
        "  wrote {}",
        resource_dir.join(qupd_core::host::BUILD_INFO_FILE).display()
    );
    Ok(())
}
