//! Generated compose stack and nginx configuration.
//!
//! Rendering is a pure function of [`StackParams`]: the same parameters
//! always produce byte-identical files, so a restart with unchanged settings
//! reproduces the previous stack exactly. Collections are ordered before
//! rendering and nothing time- or host-dependent is embedded.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;
use std::path::PathBuf;

use serde::Serialize;

use crate::utils::sha256_hash;

/// Name of the application service inside the stack
pub const APP_SERVICE: &str = "app";

/// Name of the proxy service inside the stack
pub const PROXY_SERVICE: &str = "proxy";

/// Label attached to every resource hostscale creates
pub const DEPLOYMENT_LABEL: &str = "hostscale.deployment";

const PROXY_IMAGE: &str = "nginx:1.27-alpine";

/// Where the proxy config directory is mounted inside the proxy container
pub const PROXY_MOUNT: &str = "/etc/hostscale-proxy";

/// File name of the generated proxy config inside its directory
pub const PROXY_CONFIG_NAME: &str = "nginx.conf";

const UPSTREAM: &str = "app_backend";

const RESTART_POLICY: &str = "unless-stopped";

const GENERATED_HEADER: &str = "# Generated by hostscale; overwritten on every deploy and scale.";

/// Top level of `docker-compose.yml`
#[derive(Debug, Serialize)]
struct ComposeFile {
    name: String,
    services: BTreeMap<&'static str, ComposeService>,
}

#[derive(Debug, Default, Serialize)]
struct ComposeService {
    image: String,
    restart: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    command: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    depends_on: Vec<&'static str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    expose: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    ports: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    env_file: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    labels: BTreeMap<&'static str, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    deploy: Option<ComposeDeploy>,
}

#[derive(Debug, Serialize)]
struct ComposeDeploy {
    replicas: u32,
}

/// Inputs of the composed-mode templates
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackParams {
    pub project: String,
    pub replicas: u32,
    pub port: u16,
    pub image: String,
    pub env_file: Option<PathBuf>,
    pub container_port: u16,
    pub streaming_paths: Vec<String>,
    /// Host directory holding the proxy config, mounted whole so that
    /// atomic replacements of the file are visible to the container
    pub proxy_config_dir: PathBuf,
}

/// Rendered file contents
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedStack {
    pub stack: String,
    pub proxy: String,
}

impl RenderedStack {
    /// Combined digest, handy for spotting config changes in logs
    pub fn digest(&self) -> String {
        let mut data = Vec::with_capacity(self.stack.len() + self.proxy.len() + 1);
        data.extend_from_slice(self.stack.as_bytes());
        data.push(0);
        data.extend_from_slice(self.proxy.as_bytes());
        sha256_hash(&data)
    }
}

pub fn render(params: &StackParams) -> Result<RenderedStack, serde_yaml::Error> {
    Ok(RenderedStack {
        stack: render_stack(params)?,
        proxy: render_proxy_config(params),
    })
}

/// Render `docker-compose.yml`
pub fn render_stack(params: &StackParams) -> Result<String, serde_yaml::Error> {
    let labels = BTreeMap::from([(DEPLOYMENT_LABEL, params.project.clone())]);

    let app = ComposeService {
        image: params.image.clone(),
        restart: RESTART_POLICY,
        expose: vec![params.container_port.to_string()],
        env_file: params
            .env_file
            .iter()
            .map(|path| path.to_string_lossy().into_owned())
            .collect(),
        labels: labels.clone(),
        deploy: Some(ComposeDeploy {
            replicas: params.replicas,
        }),
        ..Default::default()
    };

    let proxy_config = proxy_config_in_container();
    let proxy = ComposeService {
        image: PROXY_IMAGE.to_string(),
        restart: RESTART_POLICY,
        command: ["nginx", "-c", proxy_config.as_str(), "-g", "daemon off;"]
            .iter()
            .map(|arg| arg.to_string())
            .collect(),
        depends_on: vec![APP_SERVICE],
        ports: vec![format!("{}:80", params.port)],
        volumes: vec![format!(
            "{}:{}:ro",
            params.proxy_config_dir.to_string_lossy(),
            PROXY_MOUNT
        )],
        labels,
        ..Default::default()
    };

    let file = ComposeFile {
        name: params.project.clone(),
        services: BTreeMap::from([(APP_SERVICE, app), (PROXY_SERVICE, proxy)]),
    };
    Ok(format!("{}\n{}", GENERATED_HEADER, serde_yaml::to_string(&file)?))
}

/// Render `nginx.conf`.
///
/// Streaming paths get their own locations with connection upgrade headers
/// and long timeouts; everything else uses plain HTTP proxying.
pub fn render_proxy_config(params: &StackParams) -> String {
    let streaming: BTreeSet<String> = params
        .streaming_paths
        .iter()
        .map(|p| p.trim())
        .filter(|p| p.starts_with('/') && *p != "/")
        .map(|p| p.to_string())
        .collect();

    let mut out = String::new();
    let _ = writeln!(out, "{}", GENERATED_HEADER);
    let _ = writeln!(out, "# replicas: {}", params.replicas);
    let _ = writeln!(out, "worker_processes auto;");
    let _ = writeln!(out);
    let _ = writeln!(out, "events {{");
    let _ = writeln!(out, "    worker_connections 1024;");
    let _ = writeln!(out, "}}");
    let _ = writeln!(out);
    let _ = writeln!(out, "http {{");
    let _ = writeln!(out, "    map $http_upgrade $connection_upgrade {{");
    let _ = writeln!(out, "        default upgrade;");
    let _ = writeln!(out, "        ''      close;");
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out);
    let _ = writeln!(out, "    upstream {} {{", UPSTREAM);
    let _ = writeln!(
        out,
        "        server {}:{} max_fails=3 fail_timeout=10s;",
        APP_SERVICE, params.container_port
    );
    let _ = writeln!(out, "        keepalive 32;");
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out);
    let _ = writeln!(out, "    server {{");
    let _ = writeln!(out, "        listen 80;");

    for path in &streaming {
        let _ = writeln!(out);
        let _ = writeln!(out, "        location {} {{", path);
        let _ = writeln!(out, "            proxy_pass http://{};", UPSTREAM);
        let _ = writeln!(out, "            proxy_http_version 1.1;");
        let _ = writeln!(out, "            proxy_set_header Upgrade $http_upgrade;");
        let _ = writeln!(out, "            proxy_set_header Connection $connection_upgrade;");
        let _ = writeln!(out, "            proxy_set_header Host $host;");
        let _ = writeln!(out, "            proxy_buffering off;");
        let _ = writeln!(out, "            proxy_read_timeout 3600s;");
        let _ = writeln!(out, "            proxy_send_timeout 3600s;");
        let _ = writeln!(out, "        }}");
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "        location / {{");
    let _ = writeln!(out, "            proxy_pass http://{};", UPSTREAM);
    let _ = writeln!(out, "            proxy_http_version 1.1;");
    let _ = writeln!(out, "            proxy_set_header Connection \"\";");
    let _ = writeln!(out, "            proxy_set_header Host $host;");
    let _ = writeln!(out, "            proxy_set_header X-Real-IP $remote_addr;");
    let _ = writeln!(
        out,
        "            proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;"
    );
    let _ = writeln!(out, "            proxy_set_header X-Forwarded-Proto $scheme;");
    let _ = writeln!(out, "        }}");
    let _ = writeln!(out, "    }}");
    let _ = writeln!(out, "}}");

    out
}

/// Path of the proxy config as seen by nginx
pub fn proxy_config_in_container() -> String {
    format!("{}/{}", PROXY_MOUNT, PROXY_CONFIG_NAME)
}
