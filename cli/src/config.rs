use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rustc_hash::FxHashMap;
use serde::Deserialize;

use sluice::{err, error};
use sluice::error::{Chainable, Error, Result};
use sluice::graph::Mode;
use sluice::pipeline::OnError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Development,
    Production,
}

impl std::str::FromStr for Profile {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "development" | "dev" => Ok(Profile::Development),
            "production" | "prod" => Ok(Profile::Production),
            _ => err!("unknown profile", "profile" => s, "expected" => "development or production"),
        }
    }
}

/// Source directories of each asset class, relative to the source root.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Paths {
    pub styles: PathBuf,
    pub scripts: PathBuf,
    pub pages: PathBuf,
    pub images: PathBuf,
    pub fonts: PathBuf,
    pub favicon: PathBuf,
    pub sprite: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Paths {
            styles: "styles".into(),
            scripts: "js".into(),
            pages: "pages".into(),
            images: "img".into(),
            fonts: "fonts".into(),
            favicon: "favicon".into(),
            sprite: "img/sprite".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Server {
    pub host: String,
    pub port: u16,
    pub debounce_ms: u64,
    pub send_timeout_ms: u64,
}

impl Server {
    pub fn addr(&self) -> Result<SocketAddr> {
        let ip: IpAddr = self.host.parse()
            .map_err(Error::from_std)
            .chain_with(|| error!("invalid server host", "host" => &self.host))?;

        Ok(SocketAddr::new(ip, self.port))
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl Default for Server {
    fn default() -> Self {
        Server { host: "127.0.0.1".into(), port: 7384, debounce_ms: 100, send_timeout_ms: 2000 }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Images {
    pub jpeg_quality: u8,
    /// Images larger than this after optimization fail the pipeline.
    pub max_bytes: Option<u64>,
}

impl Default for Images {
    fn default() -> Self {
        Images { jpeg_quality: 90, max_bytes: None }
    }
}

/// Where `sluice deploy` pushes to. Only the names of the variables holding
/// the credentials are configured, never the credentials themselves.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Deploy {
    pub target: Option<String>,
    pub user_env: String,
    pub password_env: String,
}

impl Default for Deploy {
    fn default() -> Self {
        Deploy {
            target: None,
            user_env: "SLUICE_DEPLOY_USER".into(),
            password_env: "SLUICE_DEPLOY_PASSWORD".into(),
        }
    }
}

/// A `[tasks.<name>]` table.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TaskSpec {
    pub pipelines: Vec<String>,
    pub mode: Mode,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub source: PathBuf,
    pub output: PathBuf,
    pub profile: Profile,
    pub on_error: OnError,
    pub paths: Paths,
    pub server: Server,
    pub images: Images,
    pub deploy: Deploy,
    pub tasks: FxHashMap<String, TaskSpec>,
    /// Directory relative `source` and `output` are resolved against.
    #[serde(skip)]
    pub root: PathBuf,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            source: "src".into(),
            output: "build".into(),
            profile: Profile::default(),
            on_error: OnError::default(),
            paths: Paths::default(),
            server: Server::default(),
            images: Images::default(),
            deploy: Deploy::default(),
            tasks: FxHashMap::default(),
            root: PathBuf::new(),
        }
    }
}

impl Settings {
    pub const FILE_NAME: &'static str = "sluice.toml";

    /// Reads `path`, or `sluice.toml` in the working directory if it exists,
    /// then applies environment overrides. Without a file every setting has
    /// its default.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => Some(path.to_path_buf()),
            None => Some(PathBuf::from(Self::FILE_NAME)).filter(|p| p.is_file()),
        };

        let mut settings = match &path {
            Some(path) => {
                let toml = std::fs::read_to_string(path)
                    .chain_with(|| error!("failed to read config file", "path" => path.display()))?;

                let mut settings = Settings::from_toml(&toml)
                    .chain_with(|| error!("invalid config file", "path" => path.display()))?;

                settings.root = path.parent().map(Path::to_path_buf).unwrap_or_default();
                settings
            }
            None => Settings::default(),
        };

        settings.apply_env(|name| std::env::var(name).ok())?;
        Ok(settings)
    }

    pub fn from_toml(toml: &str) -> Result<Self> {
        toml::from_str(toml).map_err(Error::from_std)
    }

    /// Applies `SLUICE_OUTPUT`, `SLUICE_PROFILE`, `SLUICE_PORT` and
    /// `SLUICE_DEBOUNCE_MS` as read by `var`.
    pub fn apply_env<F: Fn(&str) -> Option<String>>(&mut self, var: F) -> Result<()> {
        if let Some(output) = var("SLUICE_OUTPUT") {
            self.output = output.into();
        }

        if let Some(profile) = var("SLUICE_PROFILE") {
            self.profile = profile.parse::<Profile>().chain_with(|| "invalid `SLUICE_PROFILE`")?;
        }

        if let Some(port) = var("SLUICE_PORT") {
            self.server.port = port.parse::<u16>()
                .map_err(Error::from_std)
                .chain_with(|| error!("invalid `SLUICE_PORT`", "value" => &port))?;
        }

        if let Some(ms) = var("SLUICE_DEBOUNCE_MS") {
            self.server.debounce_ms = ms.parse::<u64>()
                .map_err(Error::from_std)
                .chain_with(|| error!("invalid `SLUICE_DEBOUNCE_MS`", "value" => &ms))?;
        }

        Ok(())
    }

    pub fn source_dir(&self) -> PathBuf {
        self.root.join(&self.source)
    }

    pub fn output_dir(&self) -> PathBuf {
        self.root.join(&self.output)
    }

    pub fn is_production(&self) -> bool {
        self.profile == Profile::Production
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_field_defaults() {
        let settings = Settings::from_toml("").unwrap();
        assert_eq!(settings.source, Path::new("src"));
        assert_eq!(settings.output, Path::new("build"));
        assert_eq!(settings.profile, Profile::Development);
        assert_eq!(settings.on_error, OnError::Abort);
        assert_eq!(settings.paths.sprite, Path::new("img/sprite"));
        assert_eq!(settings.server.addr().unwrap(), "127.0.0.1:7384".parse().unwrap());
        assert_eq!(settings.server.debounce(), Duration::from_millis(100));
        assert_eq!(settings.images.jpeg_quality, 90);
        assert!(settings.deploy.target.is_none());
        assert!(settings.tasks.is_empty());
    }

    #[test]
    fn tables_and_tasks_parse() {
        let settings = Settings::from_toml(r#"
            output = "dist"
            profile = "production"
            on_error = "skip"

            [paths]
            scripts = "scripts"

            [server]
            port = 3000

            [images]
            max_bytes = 200000

            [deploy]
            target = "ftp://example.com/public_html"

            [tasks.assets]
            pipelines = ["images", "fonts"]
            mode = "sequential"
            depends_on = ["sprite"]
        "#).unwrap();

        assert_eq!(settings.output_dir(), Path::new("dist"));
        assert!(settings.is_production());
        assert_eq!(settings.on_error, OnError::Skip);
        assert_eq!(settings.paths.scripts, Path::new("scripts"));
        assert_eq!(settings.paths.styles, Path::new("styles"));
        assert_eq!(settings.server.port, 3000);
        assert_eq!(settings.images.max_bytes, Some(200_000));
        assert_eq!(settings.deploy.user_env, "SLUICE_DEPLOY_USER");

        let assets = &settings.tasks["assets"];
        assert_eq!(assets.pipelines, ["images", "fonts"]);
        assert_eq!(assets.mode, Mode::Sequential);
        assert_eq!(assets.depends_on, ["sprite"]);
    }

    #[test]
    fn unknown_and_mistyped_fields_are_rejected() {
        assert!(Settings::from_toml("outptu = \"dist\"").is_err());
        assert!(Settings::from_toml("profile = \"staging\"").is_err());
        assert!(Settings::from_toml("[server]\nport = \"http\"").is_err());
    }

    #[test]
    fn environment_overrides_the_file() {
        let mut settings = Settings::from_toml("output = \"dist\"").unwrap();
        let env: FxHashMap<&str, &str> = [
            ("SLUICE_OUTPUT", "public"),
            ("SLUICE_PROFILE", "prod"),
            ("SLUICE_PORT", "8080"),
            ("SLUICE_DEBOUNCE_MS", "250"),
        ].into_iter().collect();

        settings.apply_env(|name| env.get(name).map(|v| v.to_string())).unwrap();
        assert_eq!(settings.output, Path::new("public"));
        assert_eq!(settings.profile, Profile::Production);
        assert_eq!(settings.server.port, 8080);
        assert_eq!(settings.server.debounce(), Duration::from_millis(250));

        let error = settings.apply_env(|name| (name == "SLUICE_PORT").then(|| "lots".into()));
        assert!(error.is_err());
    }

    #[test]
    fn config_file_directory_is_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sluice.toml");
        std::fs::write(&path, "source = \"site\"").unwrap();

        let settings = Settings::load(Some(path.as_path())).unwrap();
        assert_eq!(settings.source_dir(), dir.path().join("site"));

        assert!(Settings::load(Some(dir.path().join("missing.toml").as_path())).is_err());
    }
}
