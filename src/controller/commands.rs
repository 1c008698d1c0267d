//! The static command table.
//!
//! Every inbound command is checked here before its handler runs: required
//! parameter keys, whether the sender expects a reply, and whether the
//! command may only come from a node connection. The enumeration is
//! exhaustive — an unlisted command name is rejected outright.

use std::collections::HashMap;
use std::sync::LazyLock;

/// One row of the command table.
#[derive(Debug, Clone, Copy)]
pub struct CommandSpec {
    pub name: &'static str,
    /// Parameter keys that must be present (list-shaped commands take none).
    pub required: &'static [&'static str],
    /// Whether the sender blocks on a reply.
    pub needs_reply: bool,
    /// Rejected when sent from a session connection.
    pub node_only: bool,
}

const fn cmd(
    name: &'static str,
    required: &'static [&'static str],
    needs_reply: bool,
    node_only: bool,
) -> CommandSpec {
    CommandSpec { name, required, needs_reply, node_only }
}

pub static COMMANDS: &[CommandSpec] = &[
    cmd("inform_external_ip", &["ip"], false, true),
    cmd("update_stats", &["stats"], false, true),
    //
    cmd("wait_tcp", &["container", "port"], true, false),
    cmd("create_tunnel", &["container", "port", "timeout"], false, false),
    cmd("destroy_tunnel", &["tunnel"], false, false),
    cmd("to_proxy", &["tunnel", "proxy"], false, false),
    cmd("close_proxy", &["tunnel", "proxy"], false, false),
    //
    cmd("cache_description", &["image_id", "description"], false, false),
    cmd("retrieve_description", &["image_id"], true, false),
    //
    cmd("upload_requirements", &[], true, false),
    cmd("upload_slab", &["sha256", "slab"], false, false),
    cmd("upload_complete", &["sha256"], false, false),
    //
    cmd("create_volume", &["tag", "async"], true, false),
    cmd("destroy_volume", &["volume"], true, false),
    cmd("snapshot_volume", &["volume"], false, false),
    cmd("rollback_volume", &["volume"], false, false),
    //
    cmd("approve_tag", &["user", "tag"], true, false),
    cmd("allocate_ip", &["container"], true, true),
    cmd("dependent_container", &["container", "node_pk", "ip", "cookie"], false, true),
    cmd("destroyed_container", &["container", "node_pk"], false, true),
    //
    cmd("prepare_domain", &["domain"], true, false),
    cmd("claim_domain", &["domain"], true, false),
    cmd("make_domain_global", &["domain"], true, false),
    cmd("make_domain_private", &["domain"], true, false),
    cmd("release_domain", &["domain"], true, false),
    //
    cmd("publish_web", &["domain", "subdomain", "rewrite", "ssl", "containers"], true, false),
    cmd("unpublish_web", &["cluster"], false, false),
    cmd("add_to_cluster", &["cluster", "container"], true, false),
    cmd("remove_from_cluster", &["cluster", "container"], false, false),
    //
    cmd("heartbeat", &[], false, false),
    cmd("ping", &[], true, false),
];

static BY_NAME: LazyLock<HashMap<&'static str, &'static CommandSpec>> =
    LazyLock::new(|| COMMANDS.iter().map(|spec| (spec.name, spec)).collect());

/// Look a command up by its wire name.
pub fn lookup(name: &[u8]) -> Option<&'static CommandSpec> {
    let name = std::str::from_utf8(name).ok()?;
    BY_NAME.get(name).copied()
}
