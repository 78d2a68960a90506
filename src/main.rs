use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, bail, Result};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use stdlib_sandbox::binding::{self, AuditOptions};
use stdlib_sandbox::config::{Config, DEFAULT_CONFIG_PATH};
use stdlib_sandbox::sandbox::{IoStream, Mediator, PolicyEvaluator, WriteStream, WriteTarget};

fn print_help() {
    println!(
        "\
stdlib-sandbox v{}

Policy mediator for the fwrite/system primitives of embedded interpreters.

USAGE:
    stdlib-sandbox <COMMAND> [OPTIONS]

COMMANDS:
    check                       Validate the policy and print its fingerprint
    exec <COMMAND...>           Run a shell command through the mediated system()
    write <TARGET> <TEXT>       Write TEXT through the mediated fwrite()
                                (TARGET: stdout, stderr or a file path)
    header                      Print the C redirection header
    audit <DIR>                 Check that every fwrite/system call site in a
                                C source tree is redirected

OPTIONS:
    -c, --config <PATH>    Policy file [default: {DEFAULT_CONFIG_PATH}]
        --forced-include   (audit) the header is injected with -include
    -h, --help             Print this help message and exit
    -V, --version          Print version and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG                 Log level filter for tracing
                             (e.g. debug, stdlib_sandbox=debug,warn)
    STDLIB_SANDBOX_CONFIG    Policy file loaded by stdlib_sandbox_init_from_env()
                             inside the interpreter

EXAMPLES:
    stdlib-sandbox check -c /etc/lua/sandbox.toml
    stdlib-sandbox exec echo hi
    stdlib-sandbox audit interpreters/lua-5.4.6/src",
        env!("CARGO_PKG_VERSION"),
    );
}

#[derive(Debug, PartialEq)]
enum Command {
    Check { config: PathBuf },
    Exec { config: PathBuf, command: String },
    Write { config: PathBuf, target: String, text: String },
    Header,
    Audit { dir: PathBuf, forced_include: bool },
}

fn parse_args(args: &[String]) -> Result<Command> {
    let mut config = PathBuf::from(DEFAULT_CONFIG_PATH);
    let mut forced_include = false;
    let mut positional: Vec<String> = Vec::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        // Everything after the exec command name belongs to the command
        if positional.first().map(String::as_str) == Some("exec") && positional.len() > 1 {
            positional.push(arg.clone());
            continue;
        }
        match arg.as_str() {
            "-c" | "--config" => {
                let path = iter
                    .next()
                    .ok_or_else(|| anyhow!("{arg} requires a path"))?;
                config = PathBuf::from(path);
            }
            "--forced-include" => forced_include = true,
            _ => positional.push(arg.clone()),
        }
    }

    let Some((name, rest)) = positional.split_first() else {
        bail!("missing command (try --help)");
    };

    match name.as_str() {
        "check" => Ok(Command::Check { config }),
        "exec" => {
            if rest.is_empty() {
                bail!("exec requires a command");
            }
            Ok(Command::Exec {
                config,
                command: rest.join(" "),
            })
        }
        "write" => match rest {
            [target, text] => Ok(Command::Write {
                config,
                target: target.clone(),
                text: text.clone(),
            }),
            _ => bail!("write requires <TARGET> <TEXT>"),
        },
        "header" => Ok(Command::Header),
        "audit" => match rest {
            [dir] => Ok(Command::Audit {
                dir: PathBuf::from(dir),
                forced_include,
            }),
            _ => bail!("audit requires <DIR>"),
        },
        other => bail!("unknown command: {other}"),
    }
}

/// First `--help`/`--version` flag meant for this program. Arguments of the
/// command given to `exec` are not ours.
fn info_flag(args: &[String]) -> Option<&str> {
    let mut seen_command = false;
    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--version" | "-V" | "--help" | "-h" => return Some(arg.as_str()),
            "-c" | "--config" => {
                iter.next();
            }
            "exec" if !seen_command => return None,
            other if !other.starts_with('-') => seen_command = true,
            _ => {}
        }
    }
    None
}

/// Opens its file only when the mediator actually writes, so a denied
/// write leaves no trace on disk.
struct LazyFile {
    path: PathBuf,
    target: WriteTarget,
}

impl LazyFile {
    /// Resolves `path` to an absolute target without creating it.
    fn new(path: &Path) -> Result<Self> {
        let name = path
            .file_name()
            .ok_or_else(|| anyhow!("not a file path: {}", path.display()))?;
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        let resolved = parent.canonicalize()?.join(name);
        Ok(Self {
            path: path.to_path_buf(),
            target: WriteTarget::path(resolved),
        })
    }
}

impl WriteStream for LazyFile {
    fn target(&self) -> WriteTarget {
        self.target.clone()
    }

    fn write_elements(&mut self, data: &[u8], size: usize, count: usize) -> usize {
        match OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(file) => IoStream::new(file, self.target.clone()).write_elements(data, size, count),
            Err(e) => {
                debug!("Cannot open {}: {e}", self.path.display());
                0
            }
        }
    }
}

fn load_mediator(config_path: &Path) -> Result<Mediator> {
    info!("Loading configuration from {}", config_path.display());
    let config = Config::load(config_path)?;
    let evaluator = Arc::new(PolicyEvaluator::new());
    evaluator.initialize(config.sandbox.clone())?;
    Ok(Mediator::new(evaluator).with_context(config.caller_context()))
}

fn run(command: Command) -> Result<i32> {
    match command {
        Command::Check { config } => {
            let config = Config::load(&config)?;
            println!("guest:       {}", config.guest.name);
            println!("policy:      {}", config.policy_description());
            println!("fingerprint: {}", config.sandbox.fingerprint());
            Ok(0)
        }
        Command::Exec { config, command } => {
            let mediator = load_mediator(&config)?;
            match mediator.try_system(&command) {
                Ok(status) if (0..=255).contains(&status) => Ok(status),
                Ok(status) => {
                    eprintln!("command failed with status {status}");
                    Ok(1)
                }
                Err(e) => {
                    eprintln!("{e}");
                    Ok(1)
                }
            }
        }
        Command::Write {
            config,
            target,
            text,
        } => {
            let mediator = load_mediator(&config)?;
            let data = text.as_bytes();
            let written = match target.as_str() {
                "stdout" => {
                    let mut stream = IoStream::new(std::io::stdout().lock(), WriteTarget::Stdout);
                    let result = mediator.try_fwrite(data, 1, data.len(), &mut stream);
                    stream.into_inner().flush()?;
                    result
                }
                "stderr" => {
                    let mut stream = IoStream::new(std::io::stderr().lock(), WriteTarget::Stderr);
                    mediator.try_fwrite(data, 1, data.len(), &mut stream)
                }
                path => {
                    let mut stream = LazyFile::new(Path::new(path))?;
                    mediator.try_fwrite(data, 1, data.len(), &mut stream)
                }
            };
            match written {
                Ok(n) if n == data.len() => Ok(0),
                Ok(n) => {
                    eprintln!("short write: {n} of {} bytes", data.len());
                    Ok(1)
                }
                Err(e) => {
                    eprintln!("{e}");
                    Ok(1)
                }
            }
        }
        Command::Header => {
            print!("{}", binding::render_wrapper_header());
            Ok(0)
        }
        Command::Audit {
            dir,
            forced_include,
        } => {
            let options = AuditOptions {
                forced_include,
                ..Default::default()
            };
            let report = binding::audit_tree(&dir, &options)?;
            for bypass in &report.bypasses {
                println!("{bypass}");
            }
            println!(
                "{} files scanned, {} bypasses",
                report.files_scanned,
                report.bypasses.len()
            );
            Ok(if report.is_complete() { 0 } else { 1 })
        }
    }
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Handle --help / --version before anything else
    match info_flag(&args) {
        Some("--version" | "-V") => {
            println!("stdlib-sandbox v{}", env!("CARGO_PKG_VERSION"));
            std::process::exit(0);
        }
        Some(_) => {
            print_help();
            std::process::exit(0);
        }
        None => {}
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stdlib_sandbox=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let command = parse_args(&args)?;
    let status = run(command)?;
    std::process::exit(status);
}
