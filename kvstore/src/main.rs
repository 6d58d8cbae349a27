use futures::{StreamExt, TryStreamExt};
use kvstore::config::KvstoreConfig;
use kvstore::{BTreeStore, LogStore, QueryOptions, StoreError, StoreOptions};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const USAGE: &str = "usage: kvstore <command>

commands:
  log-append <text>        append a record, print its index
  log-get <index>          print a record
  log-list                 print every record
  tree-set <key> <value>   insert or overwrite a key
  tree-get <key>           print the value of a key
  tree-delete <key>        remove a key
  tree-list                print every key and value";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    LogAppend(String),
    LogGet(u64),
    LogList,
    TreeSet(String, String),
    TreeGet(String),
    TreeDelete(String),
    TreeList,
}

impl Command {
    fn parse(args: &[String]) -> Option<Self> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        match args.as_slice() {
            ["log-append", text] => Some(Self::LogAppend((*text).to_string())),
            ["log-get", index] => index.parse().ok().map(Self::LogGet),
            ["log-list"] => Some(Self::LogList),
            ["tree-set", key, value] => Some(Self::TreeSet((*key).to_string(), (*value).to_string())),
            ["tree-get", key] => Some(Self::TreeGet((*key).to_string())),
            ["tree-delete", key] => Some(Self::TreeDelete((*key).to_string())),
            ["tree-list"] => Some(Self::TreeList),
            _ => None,
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kvstore=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = match KvstoreConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = Command::parse(&args) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    tracing::debug!(
        "running {command:?} in {}",
        config.directory.display()
    );
    if let Err(e) = run(&config, command).await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}

async fn run(config: &KvstoreConfig, command: Command) -> Result<(), StoreError> {
    match command {
        Command::LogAppend(_) | Command::LogGet(_) | Command::LogList => {
            let log = LogStore::new(config.log_directory());
            log.open(StoreOptions::default()).await?;
            let result = run_log(&log, command).await;
            let closed = log.close().await;
            result.and(closed)
        }
        Command::TreeSet(..) | Command::TreeGet(_) | Command::TreeDelete(_) | Command::TreeList => {
            let mut tree = BTreeStore::new(config.tree_directory());
            tree.open(StoreOptions::default(), config.tree_options())
                .await?;
            let result = run_tree(&mut tree, config, command).await;
            // A failed store has already released its lock.
            let closed = if tree.state() == kvstore::State::Open {
                tree.close().await
            } else {
                Ok(())
            };
            result.and(closed)
        }
    }
}

async fn run_log(log: &LogStore, command: Command) -> Result<(), StoreError> {
    match command {
        Command::LogAppend(text) => {
            let index = log.append(text.into_bytes()).await?;
            println!("{index}");
        }
        Command::LogGet(index) => {
            let record = log.read(index).await?;
            println!("{}", String::from_utf8_lossy(&record));
        }
        Command::LogList => {
            let mut entries = Box::pin(log.entries(QueryOptions::new()));
            while let Some((index, record)) = entries.next().await.transpose()? {
                println!("{index}\t{}", String::from_utf8_lossy(&record));
            }
        }
        _ => {}
    }
    Ok(())
}

async fn run_tree(
    tree: &mut BTreeStore,
    config: &KvstoreConfig,
    command: Command,
) -> Result<(), StoreError> {
    match command {
        Command::TreeSet(key, value) => {
            let key = pad(&key, config.key_bytes)?;
            let value = pad(&value, config.value_bytes)?;
            let inserted = tree.set(&key, &value).await?;
            println!("{}", if inserted { "inserted" } else { "updated" });
        }
        Command::TreeGet(key) => match tree.get(&pad(&key, config.key_bytes)?).await? {
            Some(value) => println!("{}", unpad(&value)),
            None => println!("(not found)"),
        },
        Command::TreeDelete(key) => {
            let deleted = tree.delete(&pad(&key, config.key_bytes)?).await?;
            println!("{}", if deleted { "deleted" } else { "(not found)" });
        }
        Command::TreeList => {
            let entries: Vec<(Vec<u8>, Vec<u8>)> =
                tree.entries(QueryOptions::new()).try_collect().await?;
            for (key, value) in entries {
                println!("{}\t{}", unpad(&key), unpad(&value));
            }
        }
        _ => {}
    }
    Ok(())
}

/// Zero-pad `text` to exactly `width` bytes.
fn pad(text: &str, width: usize) -> Result<Vec<u8>, StoreError> {
    if text.len() > width {
        return Err(StoreError::InvalidArgument(format!(
            "'{text}' is longer than {width} bytes"
        )));
    }
    let mut bytes = text.as_bytes().to_vec();
    bytes.resize(width, 0);
    Ok(bytes)
}

fn unpad(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    String::from_utf8_lossy(&bytes[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| (*w).to_string()).collect()
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(
            Command::parse(&args(&["tree-set", "a", "b"])),
            Some(Command::TreeSet("a".to_string(), "b".to_string()))
        );
        assert_eq!(Command::parse(&args(&["log-get", "7"])), Some(Command::LogGet(7)));
        assert_eq!(Command::parse(&args(&["log-get", "x"])), None);
        assert_eq!(Command::parse(&args(&["tree-list", "extra"])), None);
        assert_eq!(Command::parse(&args(&[])), None);
    }

    #[test]
    fn test_pad_and_unpad() {
        let padded = pad("abc", 5).expect("fits");
        assert_eq!(padded, b"abc\0\0");
        assert_eq!(unpad(&padded), "abc");
        assert_eq!(unpad(&[0, 0]), "");
        assert!(pad("toolong", 3).is_err());
    }
}
