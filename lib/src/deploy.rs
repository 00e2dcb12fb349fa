//! Pushes a built output tree to a remote.
//!
//! Transfers go file by file and each one is idempotent, so a failed deploy
//! can simply be rerun. Credentials are only ever read from the environment.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use std::path::{Path, PathBuf};

use derive_more::Debug;
use rustc_hash::FxHashSet;
use suppaftp::{FtpError, FtpResult, FtpStream, Status};
use suppaftp::types::FileType;

use crate::error::ErrorDetail;
use crate::util::PathExt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployError {
    /// The target could not be parsed.
    Target(String),
    Credentials(String),
    Connect(String),
    /// The remote rejected the credentials.
    Auth(String),
    Transfer { path: PathBuf, cause: String },
}

impl fmt::Display for DeployError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeployError::Target(cause) => write!(f, "invalid deploy target: {cause}"),
            DeployError::Credentials(cause) => write!(f, "missing deploy credentials: {cause}"),
            DeployError::Connect(cause) => write!(f, "failed to connect: {cause}"),
            DeployError::Auth(cause) => write!(f, "login rejected: {cause}"),
            DeployError::Transfer { path, cause } => {
                write!(f, "failed to transfer `{}`: {cause}", path.display())
            }
        }
    }
}

impl std::error::Error for DeployError {}

impl ErrorDetail for DeployError { }

/// Where a deploy goes: `ftp://host[:port]/dir` or `file:///dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Ftp { host: String, port: u16, dir: String },
    Dir(PathBuf),
}

impl FromStr for Target {
    type Err = DeployError;

    fn from_str(target: &str) -> Result<Self, Self::Err> {
        if let Some(path) = target.strip_prefix("file://") {
            if path.is_empty() {
                return Err(DeployError::Target(format!("`{target}` names no directory")));
            }

            return Ok(Target::Dir(PathBuf::from(path)));
        }

        let Some(rest) = target.strip_prefix("ftp://") else {
            return Err(DeployError::Target(format!("`{target}` is neither an ftp:// nor a file:// URL")));
        };

        let (authority, dir) = rest.split_once('/').unwrap_or((rest, ""));
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse()
                    .map_err(|_| DeployError::Target(format!("`{port}` is not a valid port")))?;

                (host, port)
            }
            None => (authority, 21),
        };

        if host.is_empty() {
            return Err(DeployError::Target(format!("`{target}` names no host")));
        }

        Ok(Target::Ftp { host: host.into(), port, dir: dir.trim_end_matches('/').into() })
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Ftp { host, port, dir } => write!(f, "ftp://{host}:{port}/{dir}"),
            Target::Dir(path) => write!(f, "file://{}", path.display()),
        }
    }
}

/// A user name and password read from the environment.
#[derive(Clone)]
pub struct Credentials {
    pub user: String,
    password: String,
}

impl Credentials {
    pub fn from_env(user_var: &str, password_var: &str) -> Result<Self, DeployError> {
        let var = |name: &str| std::env::var(name).map_err(|_| {
            DeployError::Credentials(format!("environment variable `{name}` is not set"))
        });

        Ok(Credentials { user: var(user_var)?, password: var(password_var)? })
    }

    pub fn password(&self) -> &str {
        &self.password
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A place files can be copied to. Paths are relative to the deploy root.
pub trait Remote {
    fn ensure_dir(&mut self, relative: &Path) -> Result<(), DeployError>;

    fn put(&mut self, relative: &Path, bytes: &[u8]) -> Result<(), DeployError>;

    /// Called once after the last transfer.
    fn finish(&mut self) -> Result<(), DeployError> {
        Ok(())
    }
}

#[derive(Debug)]
pub struct FtpRemote {
    #[debug(ignore)]
    stream: FtpStream,
}

impl FtpRemote {
    /// Connects, logs in, switches to binary mode and changes into `dir`,
    /// creating it first if needed.
    pub fn connect(host: &str, port: u16, dir: &str, credentials: &Credentials) -> Result<Self, DeployError> {
        let mut stream = FtpStream::connect((host, port))
            .map_err(|e| DeployError::Connect(format!("{host}:{port}: {e}")))?;

        stream.login(&credentials.user, &credentials.password)
            .map_err(|e| DeployError::Auth(e.to_string()))?;

        stream.transfer_type(FileType::Binary)
            .map_err(|e| DeployError::Connect(e.to_string()))?;

        let mut remote = FtpRemote { stream };
        if !dir.is_empty() {
            remote.ensure_dir(Path::new(dir))?;
            remote.stream.cwd(dir).map_err(|e| DeployError::Connect(format!("cannot enter `{dir}`: {e}")))?;
        }

        tracing::info!(host, port, dir, "connected to FTP server");
        Ok(remote)
    }
}

impl Remote for FtpRemote {
    fn ensure_dir(&mut self, relative: &Path) -> Result<(), DeployError> {
        let mut current = PathBuf::new();
        for component in relative.components() {
            current.push(component);
            made_or_present(self.stream.mkdir(current.to_slash_lossy()), &current)?;
        }

        Ok(())
    }

    fn put(&mut self, relative: &Path, bytes: &[u8]) -> Result<(), DeployError> {
        self.stream.put_file(relative.to_slash_lossy(), &mut Cursor::new(bytes))
            .map(|_| ())
            .map_err(|e| DeployError::Transfer { path: relative.to_path_buf(), cause: e.to_string() })
    }

    fn finish(&mut self) -> Result<(), DeployError> {
        self.stream.quit().map_err(|e| DeployError::Connect(e.to_string()))
    }
}

/// `MKD` answers `550` for a directory that already exists. Anything else
/// fails the directory.
fn made_or_present<T>(result: FtpResult<T>, dir: &Path) -> Result<(), DeployError> {
    match result {
        Ok(_) => Ok(()),
        Err(FtpError::UnexpectedResponse(response)) if matches!(response.status, Status::FileUnavailable) => Ok(()),
        Err(e) => Err(DeployError::Transfer { path: dir.to_path_buf(), cause: e.to_string() }),
    }
}

/// Mirrors into a local directory.
#[derive(Debug, Clone)]
pub struct DirRemote {
    root: PathBuf,
}

impl DirRemote {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        DirRemote { root: root.into() }
    }
}

impl Remote for DirRemote {
    fn ensure_dir(&mut self, relative: &Path) -> Result<(), DeployError> {
        std::fs::create_dir_all(self.root.join(relative))
            .map_err(|e| DeployError::Transfer { path: relative.to_path_buf(), cause: e.to_string() })
    }

    fn put(&mut self, relative: &Path, bytes: &[u8]) -> Result<(), DeployError> {
        std::fs::write(self.root.join(relative), bytes)
            .map_err(|e| DeployError::Transfer { path: relative.to_path_buf(), cause: e.to_string() })
    }
}

/// Opens the remote `target` names. Only FTP needs credentials.
pub fn connect(target: &Target, credentials: Option<&Credentials>) -> Result<Box<dyn Remote>, DeployError> {
    match target {
        Target::Dir(path) => Ok(Box::new(DirRemote::new(path))),
        Target::Ftp { host, port, dir } => {
            let credentials = credentials.ok_or_else(|| {
                DeployError::Credentials(format!("`{target}` requires a user name and password"))
            })?;

            Ok(Box::new(FtpRemote::connect(host, *port, dir, credentials)?))
        }
    }
}

#[derive(Debug, Default)]
pub struct DeployResult {
    pub transferred: usize,
    pub errors: Vec<DeployError>,
}

impl DeployResult {
    pub fn success(&self) -> bool {
        self.errors.is_empty()
    }
}

fn transfer(
    remote: &mut dyn Remote,
    made: &mut FxHashSet<PathBuf>,
    path: &Path,
    relative: &Path,
) -> Result<(), DeployError> {
    if let Some(parent) = relative.parent().filter(|p| !p.as_os_str().is_empty()) {
        if !made.contains(parent) {
            remote.ensure_dir(parent)?;
            made.insert(parent.to_path_buf());
        }
    }

    let bytes = std::fs::read(path).map_err(|e| {
        DeployError::Transfer { path: relative.to_path_buf(), cause: e.to_string() }
    })?;

    remote.put(relative, &bytes)
}

/// Copies every file under `output_dir` to `remote`, keeping relative
/// paths. A file that fails is reported and the rest still go.
pub fn deploy(output_dir: &Path, remote: &mut dyn Remote) -> DeployResult {
    let mut result = DeployResult::default();
    if !output_dir.is_dir() {
        let cause = "output directory does not exist; build first".to_string();
        result.errors.push(DeployError::Transfer { path: output_dir.to_path_buf(), cause });
        return result;
    }

    let mut made: FxHashSet<PathBuf> = FxHashSet::default();
    for entry in jwalk::WalkDir::new(output_dir).sort(true) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                let path = e.path().map_or_else(|| output_dir.to_path_buf(), Path::to_path_buf);
                result.errors.push(DeployError::Transfer { path, cause: e.to_string() });
                continue;
            }
        };

        if !entry.file_type.is_file() {
            continue;
        }

        let path = entry.path();
        let Ok(relative) = path.strip_prefix(output_dir) else { continue };
        let transferred = transfer(remote, &mut made, &path, relative);
        match transferred {
            Ok(()) => {
                tracing::debug!(path = %relative.display(), "transferred");
                result.transferred += 1;
            }
            Err(e) => {
                tracing::warn!(error = %e, "transfer failed");
                result.errors.push(e);
            }
        }
    }

    if let Err(e) = remote.finish() {
        result.errors.push(e);
    }

    tracing::info!(transferred = result.transferred, errors = result.errors.len(), "deploy finished");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("css")).unwrap();
        std::fs::create_dir_all(dir.path().join("img/icons")).unwrap();
        std::fs::write(dir.path().join("index.html"), "<p></p>").unwrap();
        std::fs::write(dir.path().join("css/styles.min.css"), ".a{color:red}").unwrap();
        std::fs::write(dir.path().join("img/icons/a.svg"), "<svg/>").unwrap();
        dir
    }

    #[test]
    fn only_existing_directories_are_ignored() {
        use suppaftp::types::Response;

        let dir = Path::new("img/icons");
        assert!(made_or_present(Ok(()), dir).is_ok());

        let exists = Response::new(Status::FileUnavailable, b"550 Directory already exists".to_vec());
        assert!(made_or_present::<()>(Err(FtpError::UnexpectedResponse(exists)), dir).is_ok());

        let denied = Response::new(Status::NotLoggedIn, b"530 Not logged in".to_vec());
        let error = made_or_present::<()>(Err(FtpError::UnexpectedResponse(denied)), dir).unwrap_err();
        assert!(matches!(&error, DeployError::Transfer { path, .. } if path == dir), "{error}");
    }

    #[test]
    fn targets_parse() {
        let ftp: Target = "ftp://example.com:2121/public_html/".parse().unwrap();
        assert_eq!(ftp, Target::Ftp { host: "example.com".into(), port: 2121, dir: "public_html".into() });

        let bare: Target = "ftp://example.com".parse().unwrap();
        assert_eq!(bare, Target::Ftp { host: "example.com".into(), port: 21, dir: "".into() });

        let dir: Target = "file:///srv/www".parse().unwrap();
        assert_eq!(dir, Target::Dir("/srv/www".into()));

        assert!("sftp://example.com".parse::<Target>().is_err());
        assert!("ftp://example.com:http/".parse::<Target>().is_err());
        assert!("ftp:///dir".parse::<Target>().is_err());
    }

    #[test]
    fn credentials_come_from_the_environment_and_stay_hidden() {
        std::env::set_var("SLUICE_TEST_DEPLOY_USER", "deployer");
        std::env::set_var("SLUICE_TEST_DEPLOY_PASSWORD", "hunter2");

        let credentials = Credentials::from_env("SLUICE_TEST_DEPLOY_USER", "SLUICE_TEST_DEPLOY_PASSWORD").unwrap();
        assert_eq!(credentials.user, "deployer");
        assert_eq!(credentials.password(), "hunter2");
        assert!(!format!("{credentials:?}").contains("hunter2"));

        let error = Credentials::from_env("SLUICE_TEST_DEPLOY_USER", "SLUICE_TEST_UNSET").unwrap_err();
        assert_eq!(error.to_string(), "missing deploy credentials: environment variable `SLUICE_TEST_UNSET` is not set");

        let target: Target = "ftp://example.com/www".parse().unwrap();
        assert!(matches!(connect(&target, None), Err(DeployError::Credentials(_))));
    }

    #[test]
    fn directory_remotes_mirror_the_tree() {
        let out = output();
        let mirror = tempfile::tempdir().unwrap();

        let mut remote = DirRemote::new(mirror.path());
        let result = deploy(out.path(), &mut remote);
        assert!(result.success());
        assert_eq!(result.transferred, 3);

        let css = std::fs::read_to_string(mirror.path().join("css/styles.min.css")).unwrap();
        assert_eq!(css, ".a{color:red}");
        assert!(mirror.path().join("img/icons/a.svg").is_file());

        assert_eq!(deploy(out.path(), &mut remote).transferred, 3);
    }

    struct Flaky {
        puts: Vec<PathBuf>,
        dirs: Vec<PathBuf>,
    }

    impl Remote for Flaky {
        fn ensure_dir(&mut self, relative: &Path) -> Result<(), DeployError> {
            self.dirs.push(relative.to_path_buf());
            Ok(())
        }

        fn put(&mut self, relative: &Path, _: &[u8]) -> Result<(), DeployError> {
            if relative.ends_with("styles.min.css") {
                return Err(DeployError::Transfer { path: relative.into(), cause: "550 denied".into() });
            }

            self.puts.push(relative.to_path_buf());
            Ok(())
        }
    }

    #[test]
    fn failed_files_do_not_stop_the_rest() {
        let out = output();
        let mut remote = Flaky { puts: vec![], dirs: vec![] };
        let result = deploy(out.path(), &mut remote);

        assert!(!result.success());
        assert_eq!(result.transferred, 2);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].to_string().contains("css/styles.min.css"));

        remote.puts.sort();
        assert_eq!(remote.puts, [PathBuf::from("img/icons/a.svg"), PathBuf::from("index.html")]);
        remote.dirs.sort();
        assert_eq!(remote.dirs, [PathBuf::from("css"), PathBuf::from("img/icons")]);

        let missing = deploy(&out.path().join("nope"), &mut remote);
        assert!(!missing.success());
    }
}
