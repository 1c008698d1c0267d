//! ZFS-backed volume provisioning.
//!
//! Volumes are datasets named `tf/vol-<uuid>` shared over NFS, carrying the
//! owner and tag as user properties (`:user` is the base64 public key with
//! the trailing `=` stripped, `:tag` is `-` when absent). The broker keeps
//! only the tagged mirror; the datasets are the authority and are
//! re-enumerated at startup.

use std::process::{Command, Stdio};

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;

use crate::model::tagged::{Tagged, TaggedStore};
use crate::model::volume::Volume;

// http://list.zfsonlinux.org/pipermail/zfs-discuss/2015-December/024087.html
const SHARE_OPTIONS: &str =
    "sharenfs=rw,no_subtree_check,crossmnt,all_squash,anonuid=0,anongid=0";

/// Create the dataset and its initial snapshot, returning the mirror entry.
pub fn create(user: &[u8], uuid: &[u8], tag: Option<&[u8]>, sync_disabled: bool) -> Result<Volume> {
    let vol = Volume {
        user: user.to_vec(),
        uuid: uuid.to_vec(),
        tag: tag.map(<[u8]>::to_vec),
    };
    let name = vol.dataset();
    let user_ascii = trimmed_user(user);
    let tag_ascii = tag.map_or_else(|| "-".to_string(), |t| String::from_utf8_lossy(t).into_owned());

    let output = Command::new("zfs")
        .args([
            "create",
            "-o", "recordsize=8k",
            "-o", "atime=off",
            "-o", SHARE_OPTIONS,
            "-o", &format!("sync={}", if sync_disabled { "disabled" } else { "standard" }),
            "-o", &format!(":user={user_ascii}"),
            "-o", &format!(":tag={tag_ascii}"),
            &name,
        ])
        .output()
        .context("running zfs create")?;
    if !output.status.success() || !output.stdout.is_empty() {
        log::error!(
            "tried to create a volume but failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
        bail!("There was a server failure");
    }
    snapshot(&vol);
    // IMPORTANT: the dataset stays mounted, unmounting breaks NFS sharing
    log::info!("created (for {user_ascii}) volume: {name}");
    Ok(vol)
}

/// Refresh the `@initial` snapshot.
pub fn snapshot(vol: &Volume) {
    let snap = format!("{}@initial", vol.dataset());
    run_zfs(&["destroy", &snap]);
    run_zfs(&["snapshot", &snap]);
}

/// Roll the dataset back to its `@initial` snapshot.
pub fn rollback(vol: &Volume) {
    run_zfs(&["rollback", &format!("{}@initial", vol.dataset())]);
}

/// Destroy the dataset and its snapshots.
pub fn destroy(vol: &Volume) {
    // -r takes the snapshot with it; zfs destroys remotely mounted
    // filesystems without complaint
    run_zfs(&["destroy", "-r", &vol.dataset()]);
    log::info!("destroyed volume: {}", vol.dataset());
}

/// Enumerate existing volume datasets into a mirror collection.
///
/// Hosts without ZFS (development machines) yield an empty mirror.
pub fn enumerate() -> TaggedStore<Volume> {
    let mut mirror = TaggedStore::new();
    let listing = match Command::new("zfs").args(["list", "-H", "-o", "name"]).output() {
        Ok(output) if output.status.success() => String::from_utf8_lossy(&output.stdout).into_owned(),
        _ => {
            log::warn!("could not enumerate volumes (no zfs?), starting with none");
            return mirror;
        }
    };

    for dataset in listing.lines().filter(|fs| fs.starts_with("tf/vol-")) {
        let Some(user_ascii) = get_property(dataset, ":user") else { continue };
        let tag = get_property(dataset, ":tag");
        let uuid = dataset["tf/vol-".len()..].as_bytes().to_vec();
        // the stored form has its trailing padding stripped
        let Ok(user) = BASE64.decode(format!("{user_ascii}=")) else {
            log::warn!("volume {dataset} has an undecodable :user property");
            continue;
        };
        let vol = Volume { user, uuid, tag: tag.map(String::into_bytes) };
        log::info!("found volume: {}", vol.display_name());
        // linux nfs does not initialise sharing from the dataset metadata
        run_zfs(&["set", SHARE_OPTIONS, dataset]);
        mirror.insert(vol);
    }
    mirror
}

fn get_property(dataset: &str, property: &str) -> Option<String> {
    let output = Command::new("zfs")
        .args(["get", "-H", "-o", "value", property, dataset])
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let value = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
    // zfs prints a dash for a blank property
    if value == "-" {
        None
    } else {
        Some(value)
    }
}

fn trimmed_user(user: &[u8]) -> String {
    let mut encoded = BASE64.encode(user);
    while encoded.ends_with('=') {
        encoded.pop();
    }
    encoded
}

fn run_zfs(args: &[&str]) {
    match Command::new("zfs").args(args).stdout(Stdio::null()).stderr(Stdio::null()).status() {
        Ok(_) => {}
        Err(e) => log::warn!("could not run zfs {}: {e}", args.join(" ")),
    }
}
