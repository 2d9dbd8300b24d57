use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

pub const DEFAULT_BACKEND_URL: &str = "http://similar-pdb.cerit-sc.cz";

/// Per-phase ports of the similarity backend (one service instance per phase).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePorts {
    pub sketches_small: u16,
    pub sketches_large: u16,
    pub full: u16,
}

impl Default for PhasePorts {
    fn default() -> Self {
        Self {
            sketches_small: 20_001,
            sketches_large: 20_002,
            full: 20_003,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirsConfig {
    /// Per-job working directories (`query<job_id>`) live here.
    pub computations: PathBuf,
    /// Binary chain archive read by the aligner.
    pub archive: PathBuf,
    /// Raw structure files used for rendering.
    pub raw_pdbs: PathBuf,
}

impl Default for DirsConfig {
    fn default() -> Self {
        Self {
            computations: PathBuf::from("/var/local/ProteinSearch/computations"),
            archive: PathBuf::from("/data/PDBe_clone_binary"),
            raw_pdbs: PathBuf::from("/data/PDBe_clone"),
        }
    }
}

/// External executables. A missing entry disables the feature that needs it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsConfig {
    #[serde(default)]
    pub aligner: Option<String>,
    #[serde(default)]
    pub pymol: Option<String>,
    #[serde(default)]
    pub convert: Option<String>,
    #[serde(default)]
    pub draw_script: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_backend_url")]
    pub backend_url: String,
    #[serde(default)]
    pub ports: PhasePorts,
    #[serde(default)]
    pub dirs: DirsConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    /// JSON snapshot seeding the in-memory structure store.
    #[serde(default)]
    pub store_snapshot: Option<PathBuf>,
}

fn default_backend_url() -> String {
    DEFAULT_BACKEND_URL.to_string()
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            backend_url: default_backend_url(),
            ports: PhasePorts::default(),
            dirs: DirsConfig::default(),
            tools: ToolsConfig::default(),
            store_snapshot: None,
        }
    }
}

fn trimmed(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl ServiceConfig {
    pub fn normalize(&mut self) {
        self.backend_url = self.backend_url.trim().to_string();
        if self.backend_url.is_empty() {
            self.backend_url = default_backend_url();
        }

        self.tools.aligner = trimmed(&self.tools.aligner);
        self.tools.pymol = trimmed(&self.tools.pymol);
        self.tools.convert = trimmed(&self.tools.convert);
        if matches!(self.tools.draw_script.as_deref(), Some(p) if p.as_os_str().is_empty()) {
            self.tools.draw_script = None;
        }
        if matches!(self.store_snapshot.as_deref(), Some(p) if p.as_os_str().is_empty()) {
            self.store_snapshot = None;
        }
    }
}

fn xdg_config_home() -> anyhow::Result<PathBuf> {
    if let Some(dir) = std::env::var_os("XDG_CONFIG_HOME") {
        let dir = PathBuf::from(dir);
        if dir.as_os_str().is_empty() {
            anyhow::bail!("XDG_CONFIG_HOME is set but empty");
        }
        return Ok(dir);
    }

    let home = std::env::var_os("HOME").ok_or_else(|| anyhow::anyhow!("HOME is not set"))?;
    let home = PathBuf::from(home);
    if home.as_os_str().is_empty() {
        anyhow::bail!("HOME is set but empty");
    }
    Ok(home.join(".config"))
}

pub fn service_config_path() -> anyhow::Result<PathBuf> {
    Ok(xdg_config_home()?.join("pdbsim").join("config.json"))
}

pub fn load_service_config_from(path: &Path) -> anyhow::Result<Option<ServiceConfig>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    let mut cfg: ServiceConfig = serde_json::from_str(&raw)?;
    cfg.normalize();
    Ok(Some(cfg))
}

pub fn save_service_config_to(path: &Path, cfg: &ServiceConfig) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid config path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let mut cfg = cfg.clone();
    cfg.normalize();

    let json = serde_json::to_string_pretty(&cfg)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

pub fn load_service_config() -> anyhow::Result<Option<ServiceConfig>> {
    load_service_config_from(&service_config_path()?)
}

pub fn save_service_config(cfg: &ServiceConfig) -> anyhow::Result<()> {
    save_service_config_to(&service_config_path()?, cfg)
}

/// Load the config at `path`, writing the defaults there on first run.
pub fn ensure_service_config_at(path: &Path) -> anyhow::Result<ServiceConfig> {
    if let Some(cfg) = load_service_config_from(path)? {
        return Ok(cfg);
    }
    let cfg = ServiceConfig::default();
    save_service_config_to(path, &cfg)?;
    Ok(cfg)
}

pub fn ensure_service_config() -> anyhow::Result<ServiceConfig> {
    ensure_service_config_at(&service_config_path()?)
}
