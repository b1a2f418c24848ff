use std::path::PathBuf;
use std::{env, process};

use git_remote_ipfs::cache::Cache;
use git_remote_ipfs::logger;

pub const NAME: &str = "git-remote-ipfs";
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() {
    match env::args().nth(1).as_deref() {
        Some("--version") => {
            println!("{NAME} {VERSION}");
            process::exit(0);
        }
        Some("hash-cache:dump") => with_cache(|cache| {
            for entry in cache.iter() {
                match entry {
                    Ok((key, value)) => println!(
                        "{}\t{}",
                        String::from_utf8_lossy(&key),
                        String::from_utf8_lossy(&value)
                    ),
                    Err(e) => {
                        eprintln!("fatal: {e}");
                        process::exit(1);
                    }
                }
            }
        }),
        Some("hash-cache:clear") => with_cache(|cache| {
            if let Err(e) = cache.clear() {
                eprintln!("fatal: {e}");
                process::exit(1);
            }
        }),
        _ => {}
    }

    logger::init(logger::env_level()).ok();

    if let Err(err) = git_remote_ipfs::run() {
        eprintln!("fatal: {err}");
        process::exit(1);
    }
}

/// Run an administrative command against the cache of the repository we
/// are invoked from, then exit.
fn with_cache(f: impl FnOnce(Cache)) -> ! {
    let git_dir = match env::var("GIT_DIR") {
        Ok(dir) => PathBuf::from(dir),
        Err(_) => match git2::Repository::discover(".") {
            Ok(repo) => repo.path().to_path_buf(),
            Err(e) => {
                eprintln!("fatal: not a git repository: {e}");
                process::exit(1);
            }
        },
    };

    match Cache::open(git_dir.join(git_remote_ipfs::CACHE_DIR)) {
        Ok(cache) => {
            f(cache);
            process::exit(0);
        }
        Err(e) => {
            eprintln!("fatal: {e}");
            process::exit(1);
        }
    }
}
