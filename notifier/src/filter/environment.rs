//! Environment enrichment
//!
//! Attaches host facts to every notice. Exactly one variant is installed per
//! client, chosen once by [`Host::detect`]:
//!
//! - `Browser`: page URL, user agent and the page origin as root directory
//! - `Process`: OS, architecture, hostname, working directory and a
//!   `params.process` block (pid, cwd, executable, argv)
//!
//! Values already present on the notice are kept.

use crate::filter::Filter;
use crate::notice::{Fields, Notice};
use async_trait::async_trait;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Page the notifier runs in, for browser-like hosts
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageInfo {
    pub url: String,
    pub user_agent: String,
}

impl PageInfo {
    pub fn new(url: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            user_agent: user_agent.into(),
        }
    }

    /// `scheme://host[:port]` of the page, empty when the URL does not parse
    pub fn origin(&self) -> String {
        Url::parse(&self.url)
            .map(|url| url.origin().ascii_serialization())
            .ok()
            .filter(|origin| origin != "null")
            .unwrap_or_default()
    }
}

/// Kind of host the client runs in
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Host {
    Browser(PageInfo),
    Process,
}

impl Host {
    /// Browser when page info is configured or the target is wasm, else process
    pub fn detect(page: Option<PageInfo>) -> Self {
        match page {
            Some(page) => Host::Browser(page),
            None if cfg!(target_arch = "wasm32") => Host::Browser(PageInfo::default()),
            None => Host::Process,
        }
    }
}

/// Process facts collected once at construction
#[derive(Debug, Clone)]
struct ProcessInfo {
    os: &'static str,
    architecture: &'static str,
    hostname: Option<String>,
    cwd: Option<String>,
    exec_path: Option<String>,
    argv: Vec<String>,
    pid: u32,
}

impl ProcessInfo {
    fn collect() -> Self {
        Self {
            os: std::env::consts::OS,
            architecture: std::env::consts::ARCH,
            hostname: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("COMPUTERNAME"))
                .ok()
                .filter(|h| !h.is_empty()),
            cwd: std::env::current_dir()
                .ok()
                .map(|p| p.display().to_string()),
            exec_path: std::env::current_exe()
                .ok()
                .map(|p| p.display().to_string()),
            argv: std::env::args().collect(),
            pid: std::process::id(),
        }
    }
}

/// Filter that adds host context
#[derive(Debug, Clone)]
pub struct EnvironmentFilter {
    host: Host,
    process: Option<ProcessInfo>,
}

impl EnvironmentFilter {
    pub fn new(host: Host) -> Self {
        let process = matches!(host, Host::Process).then(ProcessInfo::collect);
        Self { host, process }
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    fn enrich_browser(page: &PageInfo, notice: &mut Notice) {
        set_default(&mut notice.context, "url", page.url.clone());
        set_default(&mut notice.context, "userAgent", page.user_agent.clone());
        let origin = page.origin();
        if !origin.is_empty() {
            set_default(&mut notice.context, "rootDirectory", origin);
        }
    }

    fn enrich_process(info: &ProcessInfo, notice: &mut Notice) {
        set_default(&mut notice.context, "os", info.os);
        set_default(&mut notice.context, "architecture", info.architecture);
        if let Some(hostname) = &info.hostname {
            set_default(&mut notice.context, "hostname", hostname.clone());
        }
        if let Some(cwd) = &info.cwd {
            set_default(&mut notice.context, "rootDirectory", cwd.clone());
        }
        set_default(
            &mut notice.params,
            "process",
            json!({
                "pid": info.pid,
                "cwd": info.cwd,
                "execPath": info.exec_path,
                "argv": info.argv,
            }),
        );
    }
}

fn set_default(fields: &mut Fields, key: &str, value: impl Into<Value>) {
    fields.entry(key).or_insert_with(|| value.into());
}

#[async_trait]
impl Filter for EnvironmentFilter {
    fn name(&self) -> &'static str {
        match self.host {
            Host::Browser(_) => "environment-browser",
            Host::Process => "environment-process",
        }
    }

    async fn apply(&self, mut notice: Notice) -> Option<Notice> {
        match (&self.host, &self.process) {
            (Host::Browser(page), _) => Self::enrich_browser(page, &mut notice),
            (Host::Process, Some(info)) => Self::enrich_process(info, &mut notice),
            (Host::Process, None) => {}
        }
        Some(notice)
    }
}
