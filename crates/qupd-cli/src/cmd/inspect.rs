//! Inspect command

use std::path::Path;

use anyhow::{Context, Result};
use qupd_schema::{Sha256Digest, UpdatePackage};
use serde_json::json;

use crate::ui::Output;

/// Print the header fields of an update package without decrypting it.
pub fn inspect(file: &Path, json: bool) -> Result<()> {
    let bytes =
        std::fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
    let parsed = UpdatePackage::parse(&bytes)
        .with_context(|| format!("{} is not a valid update package", file.display()))?;
    let pkg = &parsed.package;
    let original_hash = Sha256Digest::from_bytes(pkg.original_hash);

    if json {
        let value = json!({
            "format": pkg.format_version.as_byte(),
            "version": pkg.product_version,
            "originalHash": original_hash.as_str(),
            "metadata": pkg.metadata.as_ref().map(|m| m.value().clone()),
            "encryptedKeyLen": pkg.encrypted_key.len(),
            "ivLen": pkg.iv.len(),
            "authTagLen": pkg.auth_tag.len(),
            "payloadLen": pkg.encrypted_payload.len(),
            "signatureLen": pkg.signature.len(),
            "signedLen": parsed.signed_content.len(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    let output = Output::new(false);
    output.field("Format", format!("v{}", pkg.format_version.as_byte()));
    output.field("Version", &pkg.product_version);
    output.field("Payload hash", &original_hash);
    if let Some(meta) = &pkg.metadata {
        output.field(
            "Main hash",
            meta.required_main_hash().unwrap_or("(not required)"),
        );
        if let Some(range) = meta.required_main_version_range() {
            output.field("Host range", range);
        }
        if let Some(created) = meta.created_at() {
            output.field("Created", created);
        }
    }
    output.field("Wrapped key", format!("{} bytes", pkg.encrypted_key.len()));
    output.field("IV / tag", format!("{} / {} bytes", pkg.iv.len(), pkg.auth_tag.len()));
    output.field("Payload", format!("{} bytes", pkg.encrypted_payload.len()));
    output.field(
        "Signature",
        format!(
            "{} bytes over {} bytes",
            pkg.signature.len(),
            parsed.signed_content.len()
        ),
    );
    Ok(())
}
