//! Front-end proxy configuration generation.
//!
//! The config file is a pure function of the live cluster set and the
//! nodes' performance counters. On any change to either, the broker
//! regenerates the file and reloads the proxy — but only when the bytes
//! actually differ, so republishing identical state never bounces the
//! front end.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use anyhow::{Context, Result};

use crate::model::Model;

const HEADER: &str = "\
global
    daemon
    maxconn 512

defaults
    mode http
    timeout connect 5s
    timeout client 50s
    timeout server 50s
    option forwardfor
    option dontlog-normal";

/// Flattened per-cluster view used by the renderer.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterView {
    pub fqdn: String,
    pub ssl_cert: Option<PathBuf>,
    pub rewrite: Option<String>,
    /// `(uuid, ip, weight)` per backend container.
    pub servers: Vec<(String, String, i64)>,
}

/// Writes `haproxy.cfg` and reloads the service on change.
#[derive(Debug)]
pub struct ProxyConfig {
    path: PathBuf,
    cert_dir: PathBuf,
}

impl ProxyConfig {
    pub fn new(path: PathBuf, cert_dir: PathBuf) -> ProxyConfig {
        ProxyConfig { path, cert_dir }
    }

    pub fn cert_dir(&self) -> &Path {
        &self.cert_dir
    }

    /// Collect the render inputs from the model. Backends hosted on a node
    /// that is not currently connected fall back to the default weight.
    pub fn views(&self, model: &Model) -> Vec<ClusterView> {
        model
            .all_clusters()
            .into_iter()
            .map(|cluster| ClusterView {
                fqdn: cluster.fqdn(),
                ssl_cert: cluster.ssl.as_ref().map(|_| cluster.cert_path(&self.cert_dir)),
                rewrite: cluster.rewrite.clone(),
                servers: cluster
                    .containers
                    .iter()
                    .filter_map(|uuid| model.container(uuid))
                    .map(|ctr| {
                        let weight = model
                            .nodes
                            .get(&ctr.node_pk)
                            .map_or(10, crate::model::node::Node::weight);
                        (String::from_utf8_lossy(&ctr.uuid).into_owned(), ctr.ip.clone(), weight)
                    })
                    .collect(),
            })
            .collect()
    }

    /// Regenerate the config and reload the front end if anything changed.
    pub fn rebuild(&self, model: &Model) -> Result<()> {
        let rendered = render(&self.views(model));
        let before = fs::read_to_string(&self.path).ok();
        if before.as_deref() == Some(rendered.as_str()) {
            return Ok(());
        }
        fs::write(&self.path, &rendered)
            .with_context(|| format!("writing proxy config: {}", self.path.display()))?;
        reload_service();
        Ok(())
    }
}

/// Render the full config. Deterministic: identical input produces
/// byte-identical output.
pub fn render(clusters: &[ClusterView]) -> String {
    let mut out = String::from(HEADER);

    for ssl_section in [false, true] {
        if ssl_section {
            out.push_str("\n\nfrontend https-in\n    bind :443");
            for cluster in clusters {
                if let Some(cert) = &cluster.ssl_cert {
                    out.push_str(&format!(" ssl crt {}", cert.display()));
                }
            }
            out.push_str(" alpn http/1.1,http/1.0");
        } else {
            out.push_str("\n\nfrontend http-in\n    bind :80");
        }

        out.push_str("\n    compression algo gzip");

        // host ACLs: the HTTP frontend names every cluster (it must match
        // plain requests to redirect them), HTTPS only the TLS ones
        for cluster in clusters {
            if !ssl_section || cluster.ssl_cert.is_some() {
                out.push_str(&format!(
                    "\n    acl {} hdr(host) -i {}",
                    acl_name(&cluster.fqdn),
                    cluster.fqdn
                ));
            }
        }

        // routing: matching TLS disposition goes to the backend, mismatches
        // on the HTTP frontend redirect to HTTPS
        for cluster in clusters {
            if cluster.ssl_cert.is_some() == ssl_section {
                out.push_str(&format!(
                    "\n    use_backend {} if {}",
                    backend_name(&cluster.fqdn),
                    acl_name(&cluster.fqdn)
                ));
            } else if !ssl_section {
                out.push_str(&format!(
                    "\n    http-request redirect scheme https if {}",
                    acl_name(&cluster.fqdn)
                ));
            }
        }
    }

    for cluster in clusters {
        out.push_str(&format!("\n\nbackend {}\n", backend_name(&cluster.fqdn)));
        if let Some(rewrite) = &cluster.rewrite {
            out.push_str(&format!("    http-request set-header Host {rewrite}\n"));
        }
        for (uuid, ip, weight) in &cluster.servers {
            out.push_str(&format!("    server {uuid} {ip}:80 weight {weight}\n"));
        }
        out.push('\n');
    }

    out
}

fn acl_name(fqdn: &str) -> String {
    format!("host_{}", fqdn.replace('.', "_"))
}

fn backend_name(fqdn: &str) -> String {
    format!("backend_{}", fqdn.replace('.', "_"))
}

fn reload_service() {
    match Command::new("systemctl")
        .args(["reload", "haproxy"])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => log::info!("front-end proxy reloaded"),
        Ok(status) => log::warn!("proxy reload exited with {status}"),
        Err(e) => log::warn!("could not reload the front-end proxy: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view(fqdn: &str, ssl: bool, rewrite: Option<&str>, servers: &[(&str, &str, i64)]) -> ClusterView {
        ClusterView {
            fqdn: fqdn.to_string(),
            ssl_cert: ssl.then(|| PathBuf::from(format!("/certs/{fqdn}.ssl"))),
            rewrite: rewrite.map(str::to_string),
            servers: servers
                .iter()
                .map(|(u, ip, w)| (u.to_string(), ip.to_string(), *w))
                .collect(),
        }
    }

    #[test]
    fn test_render_deterministic() {
        let views = vec![
            view("www.example.test", false, None, &[("ctr1", "10.2.1.5", 35)]),
            view("api.example.test", true, Some("internal.test"), &[("ctr2", "10.3.0.9", 10)]),
        ];
        assert_eq!(render(&views), render(&views));
    }

    #[test]
    fn test_frontends_and_backends_present() {
        let views = vec![view("www.example.test", false, None, &[("ctr1", "10.2.1.5", 35)])];
        let cfg = render(&views);
        assert!(cfg.contains("frontend http-in\n    bind :80"));
        assert!(cfg.contains("frontend https-in\n    bind :443 alpn http/1.1,http/1.0"));
        assert!(cfg.contains("compression algo gzip"));
        assert!(cfg.contains("acl host_www_example_test hdr(host) -i www.example.test"));
        assert!(cfg.contains("use_backend backend_www_example_test if host_www_example_test"));
        assert!(cfg.contains("server ctr1 10.2.1.5:80 weight 35"));
    }

    #[test]
    fn test_plain_cluster_not_redirected_tls_cluster_is() {
        let views = vec![
            view("plain.test", false, None, &[]),
            view("secure.test", true, None, &[]),
        ];
        let cfg = render(&views);
        // the TLS cluster redirects on the HTTP frontend
        assert!(cfg.contains("http-request redirect scheme https if host_secure_test"));
        // the plain cluster routes directly and never redirects
        assert!(!cfg.contains("redirect scheme https if host_plain_test"));
        // the HTTPS frontend lists the TLS cluster's certificate
        assert!(cfg.contains("ssl crt /certs/secure.test.ssl"));
        // only TLS clusters get an ACL on the HTTPS frontend
        let https_section = cfg.split("frontend https-in").nth(1).unwrap();
        let https_frontend = https_section.split("\n\n").next().unwrap();
        assert!(!https_frontend.contains("acl host_plain_test"));
    }

    #[test]
    fn test_rewrite_header_emitted() {
        let views = vec![view("www.example.test", false, Some("upstream.test"), &[])];
        let cfg = render(&views);
        assert!(cfg.contains("    http-request set-header Host upstream.test\n"));
    }
}
