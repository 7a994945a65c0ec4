//! Argument parsing and command execution.

use std::io::Write;
use std::path::{Path, PathBuf};

use kiln_core::{CacheRecord, CacheSettings, ConfigError, KilnError};
use kiln_storage::{DiskStore, RecordStore};

use crate::error::{CliError, CliResult};

pub const USAGE: &str = "\
usage: kiln [--cache-dir <dir> | --config <file>] <command>

commands:
  list            list stored keys
  inspect <key>   print a record's metadata and payload sizes
  purge           delete every stored record

The cache directory comes from --cache-dir, then the cache_dir entry of
--config, then KILN_CACHE_DIR.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    List,
    Inspect { key: String },
    Purge,
    Help,
}

/// Parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub command: Command,
    pub cache_dir: Option<PathBuf>,
    pub config: Option<PathBuf>,
}

fn usage(message: impl Into<String>) -> CliError {
    CliError::Usage(format!("{}\n\n{}", message.into(), USAGE))
}

fn option_value(
    flag: &str,
    inline: Option<&str>,
    rest: &mut impl Iterator<Item = String>,
) -> CliResult<PathBuf> {
    let value = match inline {
        Some(v) => v.to_string(),
        None => rest
            .next()
            .ok_or_else(|| usage(format!("{} requires a value", flag)))?,
    };
    if value.is_empty() {
        return Err(usage(format!("{} requires a value", flag)));
    }
    Ok(PathBuf::from(value))
}

/// Parse arguments, excluding the program name.
///
/// Options may appear before or after the command.
pub fn parse_args<I>(args: I) -> CliResult<Invocation>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut positional = Vec::new();
    let mut cache_dir = None;
    let mut config = None;

    while let Some(arg) = args.next() {
        let (flag, inline) = match arg.split_once('=') {
            Some((flag, value)) if flag.starts_with("--") => (flag.to_string(), Some(value)),
            _ => (arg.clone(), None),
        };
        match flag.as_str() {
            "-h" | "--help" => {
                return Ok(Invocation {
                    command: Command::Help,
                    cache_dir,
                    config,
                })
            }
            "--cache-dir" => cache_dir = Some(option_value("--cache-dir", inline, &mut args)?),
            "--config" => config = Some(option_value("--config", inline, &mut args)?),
            other if other.starts_with('-') && other.len() > 1 => {
                return Err(usage(format!("unknown option {}", other)))
            }
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        None => return Err(usage("missing command")),
        Some("list") => Command::List,
        Some("purge") => Command::Purge,
        Some("help") => Command::Help,
        Some("inspect") => {
            let key = positional
                .next()
                .ok_or_else(|| usage("inspect requires a key"))?;
            Command::Inspect { key }
        }
        Some(other) => return Err(usage(format!("unknown command {}", other))),
    };
    if let Some(extra) = positional.next() {
        return Err(usage(format!("unexpected argument {}", extra)));
    }

    Ok(Invocation {
        command,
        cache_dir,
        config,
    })
}

/// Pick the cache directory: flag, then config file, then environment.
///
/// `env_dir` is the `KILN_CACHE_DIR` value as read by [`CacheSettings::from_env`].
pub fn resolve_cache_dir(
    invocation: &Invocation,
    env_dir: Option<PathBuf>,
) -> CliResult<PathBuf> {
    if let Some(dir) = &invocation.cache_dir {
        return Ok(dir.clone());
    }
    if let Some(path) = &invocation.config {
        let settings = CacheSettings::from_path(path)?;
        return settings.cache_dir.ok_or_else(|| {
            KilnError::Config(ConfigError::MissingRequired {
                field: "cache_dir".to_string(),
            })
            .into()
        });
    }
    env_dir
        .filter(|dir| !dir.as_os_str().is_empty())
        .ok_or_else(|| usage("no cache directory given"))
}

fn render<W: Write>(out: &mut W, line: std::fmt::Arguments<'_>) -> CliResult<()> {
    out.write_fmt(line)
        .and_then(|_| out.write_all(b"\n"))
        .map_err(|e| CliError::Render(e.to_string()))
}

/// Print one key per line.
pub async fn list<W: Write>(store: &DiskStore, out: &mut W) -> CliResult<()> {
    let keys = store.keys().await?;
    tracing::debug!(cache_dir = %store.cache_dir().display(), count = keys.len(), "Listed keys");
    for key in keys {
        render(out, format_args!("{}", key))?;
    }
    Ok(())
}

/// Write a record's metadata as pretty JSON followed by its payload table.
pub fn render_record<W: Write>(record: &CacheRecord, out: &mut W) -> CliResult<()> {
    let metadata = serde_json::to_string_pretty(&record.metadata)
        .map_err(|e| CliError::Render(e.to_string()))?;
    render(out, format_args!("{}", metadata))?;
    render(out, format_args!(""))?;

    let width = record
        .payloads
        .names()
        .map(str::len)
        .chain(std::iter::once("PAYLOAD".len()))
        .max()
        .unwrap_or(0);
    render(out, format_args!("{:<width$}  BYTES", "PAYLOAD", width = width))?;
    for (name, bytes) in record.payloads.iter() {
        render(out, format_args!("{:<width$}  {}", name, bytes.len(), width = width))?;
    }
    Ok(())
}

pub async fn inspect<W: Write>(store: &DiskStore, key: &str, out: &mut W) -> CliResult<()> {
    let record = store
        .load(key)
        .await?
        .ok_or_else(|| CliError::UnknownKey(key.to_string()))?;
    render_record(&record, out)
}

/// Delete every record, reporting how many keys were present.
pub async fn purge<W: Write>(store: &DiskStore, out: &mut W) -> CliResult<()> {
    let count = store.keys().await?.len();
    store.remove_all().await?;
    tracing::info!(cache_dir = %store.cache_dir().display(), count, "Purged cache directory");
    render(out, format_args!("purged {} record(s)", count))
}

/// Execute a parsed invocation against the cache at `cache_dir`.
pub async fn run<W: Write>(command: &Command, cache_dir: &Path, out: &mut W) -> CliResult<()> {
    let store = DiskStore::new(cache_dir);
    match command {
        Command::List => list(&store, out).await,
        Command::Inspect { key } => inspect(&store, key, out).await,
        Command::Purge => purge(&store, out).await,
        Command::Help => render(out, format_args!("{}", USAGE)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiln_test_utils::assertions::assert_config_error;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    fn output(bytes: Vec<u8>) -> String {
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse_args(args(&["list"])).unwrap().command, Command::List);
        assert_eq!(parse_args(args(&["purge"])).unwrap().command, Command::Purge);
        assert_eq!(
            parse_args(args(&["inspect", "src/a.ts"])).unwrap().command,
            Command::Inspect {
                key: "src/a.ts".to_string()
            }
        );
        assert_eq!(parse_args(args(&["--help"])).unwrap().command, Command::Help);
    }

    #[test]
    fn test_parse_options_anywhere() {
        let inv = parse_args(args(&["list", "--cache-dir", "/tmp/c"])).unwrap();
        assert_eq!(inv.cache_dir, Some(PathBuf::from("/tmp/c")));

        let inv = parse_args(args(&["--config=kiln.toml", "purge"])).unwrap();
        assert_eq!(inv.config, Some(PathBuf::from("kiln.toml")));
        assert_eq!(inv.command, Command::Purge);
    }

    #[test]
    fn test_parse_errors() {
        for bad in [
            args(&[]),
            args(&["inspect"]),
            args(&["frobnicate"]),
            args(&["list", "extra"]),
            args(&["list", "--cache-dir"]),
            args(&["--verbose", "list"]),
        ] {
            let err = parse_args(bad.clone()).unwrap_err();
            assert!(matches!(err, CliError::Usage(_)), "{:?} gave {:?}", bad, err);
            assert_eq!(err.exit_code(), 2);
        }
    }

    #[test]
    fn test_cache_dir_precedence() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("kiln.toml");
        std::fs::write(&config, "cache_dir = \"/from/config\"\n").unwrap();

        let both = parse_args(args(&[
            "list",
            "--cache-dir",
            "/from/flag",
            "--config",
            config.to_str().unwrap(),
        ]))
        .unwrap();
        assert_eq!(
            resolve_cache_dir(&both, Some("/from/env".into())).unwrap(),
            PathBuf::from("/from/flag")
        );

        let config_only =
            parse_args(args(&["list", "--config", config.to_str().unwrap()])).unwrap();
        assert_eq!(
            resolve_cache_dir(&config_only, Some("/from/env".into())).unwrap(),
            PathBuf::from("/from/config")
        );

        let bare = parse_args(args(&["list"])).unwrap();
        assert_eq!(
            resolve_cache_dir(&bare, Some("/from/env".into())).unwrap(),
            PathBuf::from("/from/env")
        );
        assert!(matches!(
            resolve_cache_dir(&bare, Some(PathBuf::new())),
            Err(CliError::Usage(_))
        ));
    }

    #[test]
    fn test_config_without_cache_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("kiln.toml");
        std::fs::write(&config, "persist = false\n").unwrap();

        let inv = parse_args(args(&["list", "--config", config.to_str().unwrap()])).unwrap();
        match resolve_cache_dir(&inv, None) {
            Err(CliError::Kiln(err)) => assert_config_error::<()>(&Err(err), "cache_dir"),
            other => panic!("expected config error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_list_inspect_purge() {
        let dir = tempfile::tempdir().unwrap();
        let store = DiskStore::new(dir.path());
        let record = CacheRecord::with_sources(["/src/a.ts"])
            .with_payload("transpiledOutput", "console.log(1);")
            .with_payload("sourceMap", "{}")
            .with_meta("sourceLength", 12);
        store.write("src/a.ts", &record).await.unwrap();
        store.write("b.ts", &record).await.unwrap();

        let mut out = Vec::new();
        run(&Command::List, dir.path(), &mut out).await.unwrap();
        assert_eq!(output(out), "b.ts\nsrc/a.ts\n");

        let mut out = Vec::new();
        let inspect = Command::Inspect {
            key: "src/a.ts".to_string(),
        };
        run(&inspect, dir.path(), &mut out).await.unwrap();
        let text = output(out);
        assert!(text.contains("\"sourceLength\": 12"));
        assert!(text.contains("\"sourcePaths\""));
        assert!(text.contains(&format!("{:<16}  BYTES\n", "PAYLOAD")));
        assert!(text.contains(&format!("{:<16}  15\n", "transpiledOutput")));
        assert!(text.contains(&format!("{:<16}  2\n", "sourceMap")));

        let mut out = Vec::new();
        run(&Command::Purge, dir.path(), &mut out).await.unwrap();
        assert_eq!(output(out), "purged 2 record(s)\n");
        assert!(store.keys().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_inspect_unknown_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut out = Vec::new();
        let err = run(
            &Command::Inspect {
                key: "missing.ts".to_string(),
            },
            dir.path(),
            &mut out,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, CliError::UnknownKey(key) if key == "missing.ts"));
    }

    #[tokio::test]
    async fn test_missing_cache_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let absent = dir.path().join("nope");
        let mut out = Vec::new();
        run(&Command::List, &absent, &mut out).await.unwrap();
        assert!(out.is_empty());

        run(&Command::Purge, &absent, &mut out).await.unwrap();
        assert_eq!(output(out), "purged 0 record(s)\n");
    }
}
