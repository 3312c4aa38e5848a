use std::io::{self, Read, Write};

use anyhow::{Result, bail};
use chrono::{DateTime, Utc};
use tracing::debug;
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

use lockbox_client::{Collection, Item, SearchFlags, Service, ServiceFlags, password};
use lockbox_core::paths::COLLECTION_PREFIX;
use lockbox_core::schema::SCHEMA_ATTRIBUTE;
use lockbox_core::{Attributes, CONTENT_TYPE_BINARY, CONTENT_TYPE_TEXT, SecretValue};

const LOG_ENV: &str = "LOCKBOX_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputFormat {
    Text,
    Json,
}

impl OutputFormat {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Self::Text),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Store {
        label: String,
        collection: Option<String>,
        attrs: Attributes,
    },
    Lookup {
        attrs: Attributes,
    },
    Clear {
        attrs: Attributes,
    },
    Search {
        all: bool,
        unlock: bool,
        format: OutputFormat,
        attrs: Attributes,
    },
    Lock {
        collection: Option<String>,
    },
    Unlock {
        collection: Option<String>,
    },
    Help,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Reset SIGPIPE so `lockbox search | head` exits quietly.
    #[cfg(unix)]
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_command(&args) {
        Ok(command) => command,
        Err(msg) => {
            eprintln!("lockbox: {msg}");
            print_usage();
            std::process::exit(2);
        }
    };

    match command {
        Command::Help => {
            print_usage();
            Ok(())
        }
        Command::Store {
            label,
            collection,
            attrs,
        } => cmd_store(&label, collection.as_deref(), &attrs).await,
        Command::Lookup { attrs } => cmd_lookup(&attrs).await,
        Command::Clear { attrs } => cmd_clear(&attrs).await,
        Command::Search {
            all,
            unlock,
            format,
            attrs,
        } => cmd_search(all, unlock, format, &attrs).await,
        Command::Lock { collection } => cmd_lock(collection.as_deref(), true).await,
        Command::Unlock { collection } => cmd_lock(collection.as_deref(), false).await,
    }
}

fn print_usage() {
    eprintln!(
        "\
usage: lockbox store --label='label' [--collection='alias'] attribute value ...
       lockbox lookup attribute value ...
       lockbox clear attribute value ...
       lockbox search [--all] [--unlock] [--format=text|json] attribute value ...
       lockbox lock [--collection='collection']
       lockbox unlock [--collection='collection']

ENVIRONMENT:
    LOCKBOX_CONFIG    config file (default ~/.config/lockbox/config.toml)
    LOCKBOX_LOG       log filter (default warn)"
    );
}

// ---------------------------------------------------------------------------
// argument parsing
// ---------------------------------------------------------------------------

/// Value of `--name=value` or `--name value` at `args[*i]`, advancing `i`
/// past a separate value.
fn option_value(args: &[String], i: &mut usize, name: &str) -> Result<Option<String>, String> {
    let arg = &args[*i];
    let long = format!("--{name}");
    if let Some(value) = arg.strip_prefix(&format!("{long}=")) {
        return Ok(Some(value.to_string()));
    }
    if *arg != long {
        return Ok(None);
    }
    *i += 1;
    match args.get(*i) {
        Some(value) => Ok(Some(value.clone())),
        None => Err(format!("{long} requires a value")),
    }
}

fn attribute_pairs(rest: &[String]) -> Result<Attributes, String> {
    if rest.is_empty() {
        return Err("must specify attribute and value pairs".to_string());
    }
    if rest.len() % 2 != 0 {
        return Err("must specify attributes and values in pairs".to_string());
    }
    Ok(rest
        .chunks_exact(2)
        .map(|pair| (pair[0].clone(), pair[1].clone()))
        .collect())
}

fn parse_command(args: &[String]) -> Result<Command, String> {
    let Some(cmd) = args.first() else {
        return Err("no command given".to_string());
    };

    let mut label = None;
    let mut collection = None;
    let mut all = false;
    let mut unlock = false;
    let mut format = OutputFormat::Text;
    let mut rest = Vec::new();

    let mut i = 1;
    while i < args.len() {
        let arg = &args[i];
        if let Some(v) = option_value(args, &mut i, "label")? {
            label = Some(v);
        } else if let Some(v) = option_value(args, &mut i, "collection")? {
            collection = Some(v);
        } else if let Some(v) = option_value(args, &mut i, "format")? {
            format = OutputFormat::parse(&v)
                .ok_or_else(|| format!("unknown format '{v}': use text or json"))?;
        } else if arg == "--all" || arg == "-a" {
            all = true;
        } else if arg == "--unlock" {
            unlock = true;
        } else if arg == "--" {
            rest.extend(args[i + 1..].iter().cloned());
            break;
        } else if arg.starts_with("--") {
            return Err(format!("unknown option: {arg}"));
        } else {
            rest.push(arg.clone());
        }
        i += 1;
    }

    match cmd.as_str() {
        "store" => Ok(Command::Store {
            label: label.ok_or("must specify a label for the new item")?,
            collection,
            attrs: attribute_pairs(&rest)?,
        }),
        "lookup" => Ok(Command::Lookup {
            attrs: attribute_pairs(&rest)?,
        }),
        "clear" => Ok(Command::Clear {
            attrs: attribute_pairs(&rest)?,
        }),
        "search" => Ok(Command::Search {
            all,
            unlock,
            format,
            attrs: attribute_pairs(&rest)?,
        }),
        "lock" => Ok(Command::Lock { collection }),
        "unlock" => Ok(Command::Unlock { collection }),
        "help" | "--help" | "-h" => Ok(Command::Help),
        other => Err(format!("unknown command: {other}")),
    }
}

// ---------------------------------------------------------------------------
// terminal I/O
// ---------------------------------------------------------------------------

fn is_tty(fd: libc::c_int) -> bool {
    // SAFETY: isatty only inspects the descriptor.
    unsafe { libc::isatty(fd) == 1 }
}

/// Read one line from `fd` with terminal echo disabled, restoring the
/// original settings afterwards.
#[cfg(unix)]
fn read_hidden(fd: std::os::unix::io::RawFd) -> io::Result<Zeroizing<String>> {
    use std::io::BufRead as _;
    use std::os::unix::io::FromRawFd as _;

    // SAFETY: fd is open for the life of the process and term is written by
    // tcgetattr before use.
    let orig = unsafe {
        let mut term = std::mem::MaybeUninit::<libc::termios>::uninit();
        if libc::tcgetattr(fd, term.as_mut_ptr()) != 0 {
            return Err(io::Error::last_os_error());
        }
        term.assume_init()
    };

    let mut noecho = orig;
    noecho.c_lflag &= !(libc::ECHO as libc::tcflag_t);
    noecho.c_lflag &= !(libc::ECHONL as libc::tcflag_t);
    unsafe {
        if libc::tcsetattr(fd, libc::TCSAFLUSH, &noecho) != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    let mut line = Zeroizing::new(String::new());
    let result = {
        // SAFETY: ManuallyDrop keeps the borrowed fd open.
        let file = unsafe { std::fs::File::from_raw_fd(fd) };
        let file = std::mem::ManuallyDrop::new(file);
        io::BufReader::new(&*file).read_line(&mut line)
    };

    unsafe { libc::tcsetattr(fd, libc::TCSANOW, &orig) };
    eprintln!();

    result?;
    let trimmed = line.trim_end_matches('\n').trim_end_matches('\r');
    Ok(Zeroizing::new(trimmed.to_string()))
}

/// The secret to store: prompted for on a terminal, otherwise all of stdin.
async fn read_secret() -> Result<SecretValue> {
    tokio::task::spawn_blocking(|| -> Result<SecretValue> {
        if is_tty(0) {
            eprint!("Password: ");
            io::stderr().flush()?;
            let password = read_hidden(0)?;
            return Ok(SecretValue::from_zeroizing(
                Zeroizing::new(password.as_bytes().to_vec()),
                CONTENT_TYPE_TEXT,
            ));
        }
        let mut bytes = Zeroizing::new(Vec::new());
        io::stdin().read_to_end(&mut bytes)?;
        if std::str::from_utf8(&bytes).is_err() {
            bail!("password not valid UTF-8");
        }
        Ok(SecretValue::from_zeroizing(bytes, CONTENT_TYPE_TEXT))
    })
    .await
    .map_err(|e| anyhow::anyhow!("input task panicked: {e}"))?
}

/// Services have stored passwords as untyped bytes, so accept those when
/// they are valid UTF-8.
fn is_password(value: &SecretValue) -> bool {
    if value.text().is_some() {
        return true;
    }
    let content_type = value.content_type();
    (content_type.is_empty() || content_type == CONTENT_TYPE_BINARY)
        && std::str::from_utf8(value.get()).is_ok()
}

fn format_when(secs: u64) -> String {
    if secs == 0 {
        return String::new();
    }
    i64::try_from(secs)
        .ok()
        .and_then(|s| DateTime::<Utc>::from_timestamp(s, 0))
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| secs.to_string())
}

fn item_id(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

// ---------------------------------------------------------------------------
// commands
// ---------------------------------------------------------------------------

async fn cmd_store(label: &str, collection: Option<&str>, attrs: &Attributes) -> Result<()> {
    let value = read_secret().await?;
    debug!(label, collection = collection.unwrap_or("default"), "storing secret");
    if !password::store_binary(None, attrs, collection, label, &value, None).await? {
        bail!("store was dismissed");
    }
    Ok(())
}

async fn cmd_lookup(attrs: &Attributes) -> Result<()> {
    let Some(value) = password::lookup_binary(None, attrs, None).await? else {
        debug!("no matching secret");
        std::process::exit(1);
    };
    if !is_password(&value) {
        bail!("secret does not contain a textual password");
    }
    let mut out = io::stdout().lock();
    out.write_all(value.get())?;
    if is_tty(1) {
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

async fn cmd_clear(attrs: &Attributes) -> Result<()> {
    if !password::clear(None, attrs, None).await? {
        std::process::exit(1);
    }
    Ok(())
}

async fn cmd_search(
    all: bool,
    unlock: bool,
    format: OutputFormat,
    attrs: &Attributes,
) -> Result<()> {
    let mut flags = SearchFlags::LOAD_SECRETS;
    if all {
        flags = flags | SearchFlags::ALL;
    }
    if unlock {
        flags = flags | SearchFlags::UNLOCK;
    }
    let items = password::search(None, attrs, flags, None).await?;
    debug!(count = items.len(), "search finished");

    match format {
        OutputFormat::Text => {
            let mut out = io::stdout().lock();
            for item in &items {
                print_item(&mut out, item)?;
            }
            out.flush()?;
        }
        OutputFormat::Json => print_items_json(&items)?,
    }
    Ok(())
}

fn sorted_attributes(item: &Item) -> Vec<(String, String)> {
    let mut attrs: Vec<(String, String)> = item.attributes().into_iter().collect();
    attrs.sort();
    attrs
}

fn print_item(out: &mut impl Write, item: &Item) -> io::Result<()> {
    writeln!(out, "[{}]", item_id(item.path()))?;
    writeln!(out, "label = {}", item.label())?;
    write_secret_line(out, item.secret().as_ref())?;
    writeln!(out, "created = {}", format_when(item.created()))?;
    writeln!(out, "modified = {}", format_when(item.modified()))?;
    if let Some(schema) = item.schema_name() {
        writeln!(out, "schema = {schema}")?;
    }
    for (k, v) in sorted_attributes(item) {
        if k != SCHEMA_ATTRIBUTE {
            writeln!(out, "attribute.{k} = {v}")?;
        }
    }
    Ok(())
}

/// Only textual secrets are printed; binary payloads are left out.
fn write_secret_line(out: &mut impl Write, secret: Option<&SecretValue>) -> io::Result<()> {
    let Some(secret) = secret.filter(|s| is_password(s)) else {
        return Ok(());
    };
    write!(out, "secret = ")?;
    out.write_all(secret.get())?;
    writeln!(out)
}

fn print_items_json(items: &[Item]) -> Result<()> {
    let json_items: Vec<serde_json::Value> = items
        .iter()
        .map(|item| {
            let mut obj = serde_json::Map::new();
            obj.insert("id".into(), item_id(item.path()).into());
            obj.insert("path".into(), item.path().into());
            obj.insert("label".into(), item.label().into());
            obj.insert("locked".into(), item.locked().into());
            obj.insert("created".into(), format_when(item.created()).into());
            obj.insert("modified".into(), format_when(item.modified()).into());
            if let Some(secret) = item.secret().filter(is_password) {
                let text = String::from_utf8_lossy(secret.get()).into_owned();
                obj.insert("secret".into(), text.into());
            }
            let attrs: serde_json::Map<String, serde_json::Value> = sorted_attributes(item)
                .into_iter()
                .map(|(k, v)| (k, v.into()))
                .collect();
            obj.insert("attributes".into(), attrs.into());
            serde_json::Value::Object(obj)
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&json_items)?);
    Ok(())
}

/// Lock or unlock one named collection, or every collection.
async fn cmd_lock(name: Option<&str>, lock: bool) -> Result<()> {
    let service = Service::get(ServiceFlags::LOAD_COLLECTIONS).await?;
    let collections: Vec<Collection> = match name {
        Some(name) => {
            let path = if name.starts_with('/') {
                name.to_string()
            } else {
                format!("{COLLECTION_PREFIX}{name}")
            };
            vec![service.collection_for_path(&path).await?]
        }
        None => service.collections().unwrap_or_default(),
    };
    if collections.is_empty() {
        bail!("no collections found");
    }
    debug!(count = collections.len(), lock, "changing lock state");

    let changed = if lock {
        service.lock(&collections, None).await?
    } else {
        service.unlock(&collections, None).await?
    };
    if changed.len() < collections.len() {
        let verb = if lock { "lock" } else { "unlock" };
        bail!(
            "could not {verb} {} of {} collections",
            collections.len() - changed.len(),
            collections.len()
        );
    }
    Ok(())
}
