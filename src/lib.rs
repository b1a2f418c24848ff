#![warn(clippy::unwrap_used)]
//! A Git remote helper that stores repositories on IPFS.
//!
//! The remote is a UnixFS directory holding the working tree of the last
//! pushed branch, plus a `.git/` metadata dag carrying the full history:
//! commits, tags, parent graphs, signatures and file modes, enough to
//! reconstruct every object byte for byte.
//!
//! Communication with the user is done via `stderr`; communication with
//! Git tooling is done via `stdout`.

pub mod cache;
pub mod dag;
pub mod fetch;
pub mod ipfs;
pub mod list;
pub mod logger;
pub mod push;
pub mod resolver;

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::str::FromStr;
use std::{env, fmt, io};

use thiserror::Error;

use crate::cache::Cache;
use crate::dag::Vfs;
use crate::ipfs::IpfsClient;
use crate::push::Command;
use crate::resolver::Registry;

/// Name of the cache directory inside `$GIT_DIR`.
pub const CACHE_DIR: &str = "remote-ipfs";

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid arguments received.
    #[error("invalid arguments: {0:?}")]
    InvalidArguments(Vec<String>),
    /// Invalid command received.
    #[error("invalid command `{0}`")]
    InvalidCommand(String),
    /// The `GIT_DIR` env var is not set.
    #[error("the `GIT_DIR` environment variable is not set")]
    NoGitDir,
    /// I/O error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    /// Error with the remote url.
    #[error("invalid remote url: {0}")]
    RemoteUrl(#[from] UrlError),
    /// The `.git` node of an existing remote could not be decoded.
    #[error("malformed remote at {cid}: {reason}")]
    MalformedRemote { cid: String, reason: String },
    /// Git error.
    #[error("git: {0}")]
    Git(#[from] git2::Error),
    /// IPFS error.
    #[error(transparent)]
    Ipfs(#[from] ipfs::Error),
    /// Cache error.
    #[error(transparent)]
    Cache(#[from] cache::Error),
    /// Push error.
    #[error(transparent)]
    Push(#[from] push::Error),
    /// Fetch error.
    #[error(transparent)]
    Fetch(#[from] fetch::Error),
    /// List error.
    #[error(transparent)]
    List(#[from] list::Error),
}

#[derive(Debug, Error)]
pub enum UrlError {
    #[error("empty remote url")]
    Empty,
    #[error("`{0}` is missing a repository name")]
    MissingName(String),
}

/// Where a remote lives: `ipfs://<name>` names a brand-new remote, while a
/// bare CID continues an existing one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Url {
    Name(String),
    Cid(String),
}

impl FromStr for Url {
    type Err = UrlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Err(UrlError::Empty);
        }
        if let Some(name) = s.strip_prefix("ipfs://") {
            if name.is_empty() {
                return Err(UrlError::MissingName(s.to_owned()));
            }
            Ok(Self::Name(name.to_owned()))
        } else {
            Ok(Self::Cid(s.strip_prefix("/ipfs/").unwrap_or(s).to_owned()))
        }
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Name(name) => write!(f, "ipfs://{name}"),
            Self::Cid(cid) => write!(f, "{cid}"),
        }
    }
}

/// Shared state of one helper invocation.
pub(crate) struct Context {
    pub repo: git2::Repository,
    pub ipfs: IpfsClient,
    pub cache: Cache,
    pub push_flights: Registry<git2::Oid, String>,
    pub fetch_flights: Registry<String, git2::Oid>,
}

/// An open connection between a local repository and an IPFS remote.
pub struct Remote {
    ctx: Rc<Context>,
    /// The remote's `.git` node; preloaded for existing remotes so the
    /// repository `uuid` and untouched refs carry across pushes.
    pub vfs: Vfs,
}

impl Remote {
    /// Open the repository at `git_dir` against the remote at `url`,
    /// talking to the IPFS node at `api_url`.
    pub async fn open(git_dir: &Path, url: &Url, api_url: &str) -> Result<Self, Error> {
        let repo = git2::Repository::open(git_dir)?;
        let cache = Cache::open(repo.path().join(CACHE_DIR))?;
        let ipfs = IpfsClient::new(api_url);
        let vfs = match url {
            Url::Name(name) => Vfs::named(name),
            Url::Cid(cid) => {
                let value = ipfs.dag_get(&format!("{cid}/.git")).await?;
                serde_json::from_value(value).map_err(|e| Error::MalformedRemote {
                    cid: cid.clone(),
                    reason: e.to_string(),
                })?
            }
        };

        Ok(Self {
            ctx: Rc::new(Context {
                repo,
                ipfs,
                cache,
                push_flights: Registry::new(),
                fetch_flights: Registry::new(),
            }),
            vfs,
        })
    }

    /// List the remote's refs as `(oid, refpath)` pairs.
    pub async fn list(&self) -> Result<Vec<(String, String)>, Error> {
        Ok(list::refs(&self.ctx, &self.vfs).await?)
    }

    /// Push a batch of refs. Returns the new root CID if at least one ref
    /// was pushed.
    pub async fn push(&mut self, commands: &[Command]) -> Result<Option<String>, Error> {
        Ok(push::run(&self.ctx, &mut self.vfs, commands).await?)
    }

    /// Fetch a batch of `(oid, refpath)` pairs into the local repository.
    pub async fn fetch(&self, wants: &[(String, String)]) -> Result<(), Error> {
        Ok(fetch::run(&self.ctx, &self.vfs, wants).await?)
    }

    /// The translation cache backing this remote.
    pub fn cache(&self) -> &Cache {
        &self.ctx.cache
    }
}

/// Run the remote helper. Git invokes helpers as
/// `git-remote-ipfs <remote> [<url>]` with `GIT_DIR` set to the working
/// copy's git directory.
pub fn run() -> Result<(), Error> {
    let url: Url = {
        let args = env::args().skip(1).take(2).collect::<Vec<_>>();

        match args.as_slice() {
            [url] => url.parse(),
            [_, url] => url.parse(),

            _ => {
                return Err(Error::InvalidArguments(args));
            }
        }
    }?;

    // `GIT_DIR` is expected to be set by Git tooling, and points to the
    // working copy.
    let git_dir = env::var("GIT_DIR")
        .map(PathBuf::from)
        .map_err(|_| Error::NoGitDir)?;
    let api_url = env::var("IPFS_API_URL").unwrap_or_else(|_| ipfs::DEFAULT_API_URL.to_owned());

    // All translation work runs on one thread; in-flight I/O interleaves
    // at await points.
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    let local = tokio::task::LocalSet::new();

    runtime.block_on(local.run_until(session(git_dir, url, api_url)))
}

async fn session(git_dir: PathBuf, url: Url, api_url: String) -> Result<(), Error> {
    let mut remote = Remote::open(&git_dir, &url, &api_url).await?;
    let stdin = io::stdin();
    let mut line = String::new();

    loop {
        let tokens = read_line(&stdin, &mut line)?;

        log::debug!(target: "helper", "{:?}", &tokens);

        match tokens.as_slice() {
            ["capabilities"] => {
                println!("option");
                println!("push"); // Implies `list` command.
                println!("fetch");
                println!();
            }
            ["option", "verbosity", ..] => {
                println!("ok");
            }
            ["option", ..] => {
                println!("unsupported");
            }
            ["list"] | ["list", "for-push"] => {
                for (oid, name) in remote.list().await? {
                    println!("{oid} {name}");
                }
                if let Some(head) = &remote.vfs.head {
                    println!("@{head} HEAD");
                }
                println!();
            }
            ["fetch", oid, refname] => {
                let mut wants = vec![(oid.to_string(), refname.to_string())];
                read_fetch_batch(&stdin, &mut wants)?;

                remote.fetch(&wants).await?;
                // Nb. An empty line means we're done.
                println!();

                return Ok(());
            }
            ["push", spec] => {
                let mut commands = vec![Command::from_str(spec).map_err(Error::Push)?];
                read_push_batch(&stdin, &mut commands)?;

                let root = remote.push(&commands).await?;
                println!();
                // The last line of output is the new root CID, for wrapper
                // tooling to pick up.
                if let Some(root) = root {
                    println!("{root}");
                }

                return Ok(());
            }
            [] => {
                return Ok(());
            }
            _ => {
                return Err(Error::InvalidCommand(line.trim().to_owned()));
            }
        }
    }
}

/// Read the remainder of a `fetch` batch, until the empty line.
fn read_fetch_batch(stdin: &io::Stdin, wants: &mut Vec<(String, String)>) -> Result<(), Error> {
    let mut line = String::new();
    loop {
        let tokens = read_line(stdin, &mut line)?;
        match tokens.as_slice() {
            ["fetch", oid, refname] => {
                wants.push((oid.to_string(), refname.to_string()));
            }
            [] => return Ok(()),
            _ => return Err(Error::InvalidCommand(line.trim().to_owned())),
        }
    }
}

/// Read the remainder of a `push` batch, until the empty line.
fn read_push_batch(stdin: &io::Stdin, commands: &mut Vec<Command>) -> Result<(), Error> {
    let mut line = String::new();
    loop {
        let tokens = read_line(stdin, &mut line)?;
        match tokens.as_slice() {
            ["push", spec] => {
                commands.push(Command::from_str(spec).map_err(Error::Push)?);
            }
            [] => return Ok(()),
            _ => return Err(Error::InvalidCommand(line.trim().to_owned())),
        }
    }
}

/// Read one line from stdin, and split it into tokens.
pub(crate) fn read_line<'a>(stdin: &io::Stdin, line: &'a mut String) -> io::Result<Vec<&'a str>> {
    line.clear();

    let read = stdin.read_line(line)?;
    if read == 0 {
        return Ok(vec![]);
    }
    let line = line.trim();
    let tokens = line.split(' ').filter(|t| !t.is_empty()).collect();

    Ok(tokens)
}

pub(crate) fn is_not_found(e: &git2::Error) -> bool {
    e.code() == git2::ErrorCode::NotFound
}
