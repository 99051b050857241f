//! skycli - poke the Skywatch arbiter from a terminal.
//!
//! Logs in as a client, runs one command, prints the result. `monitor`
//! stays connected and follows broadcasts until interrupted.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use owo_colors::OwoColorize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use skycore::ValueStore;
use skyproto::{state, Completion, Params, TypeWord};

#[derive(Parser, Debug)]
#[command(name = "skycli", about = "Operator CLI for the Skywatch control plane")]
struct Cli {
    /// Arbiter host
    #[arg(long, default_value = "localhost", env = "SKYWATCH_HOST")]
    host: String,

    /// Arbiter port
    #[arg(long, default_value_t = 5557, env = "SKYWATCH_PORT")]
    port: u16,

    /// Login name
    #[arg(long, default_value = "skycli")]
    login: String,

    /// Password (defaults to the login, the historical convention)
    #[arg(long)]
    password: Option<String>,

    /// Print machine-readable JSON where applicable
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Ask for an aggregated status snapshot
    Status,
    /// List registered devices and logged-in users
    Info,
    /// Request observing priority
    Priority {
        value: i32,
        /// Release automatically after this many seconds
        #[arg(long)]
        timeout: Option<i64>,
    },
    /// Change an arbiter value, e.g. `set morning_off = 1`
    Set {
        name: String,
        /// One of `=`, `+=`, `-=`
        #[arg(allow_hyphen_values = true)]
        op: String,
        #[arg(allow_hyphen_values = true)]
        args: Vec<String>,
    },
    /// Switch the system on / to standby / off
    Switch {
        #[arg(value_parser = ["on", "standby", "off"])]
        target: String,
    },
    /// Follow broadcasts until interrupted
    Monitor,
}

struct Session {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Session {
    async fn connect(cli: &Cli) -> Result<Self> {
        let stream = TcpStream::connect((cli.host.as_str(), cli.port))
            .await
            .with_context(|| format!("cannot reach arbiter at {}:{}", cli.host, cli.port))?;
        let (read_half, writer) = stream.into_split();
        let mut session = Session { reader: BufReader::new(read_half), writer };

        session.send(&format!("login {}", cli.login)).await?;
        session.wait_completion().await?.into_result()?;
        let password = cli.password.clone().unwrap_or_else(|| cli.login.clone());
        session.send(&format!("password {password}")).await?;
        session.wait_completion().await?.into_result()?;
        Ok(session)
    }

    async fn send(&mut self, line: &str) -> Result<()> {
        self.writer.write_all(format!("{line}\n").as_bytes()).await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(line.trim_end().to_string()))
    }

    /// Read lines until a completion arrives; everything before it is
    /// returned for the caller to interpret.
    async fn collect_until_completion(&mut self) -> Result<(Vec<String>, Completion)> {
        let mut collected = Vec::new();
        loop {
            let Some(line) = self.read_line().await? else {
                bail!("arbiter closed the connection");
            };
            if let Some(completion) = Completion::parse(&line)? {
                return Ok((collected, completion));
            }
            collected.push(line);
        }
    }

    async fn wait_completion(&mut self) -> Result<Completion> {
        Ok(self.collect_until_completion().await?.1)
    }
}

trait IntoResult {
    fn into_result(self) -> Result<()>;
}

impl IntoResult for Completion {
    fn into_result(self) -> Result<()> {
        if self.is_ok() {
            Ok(())
        } else {
            bail!("arbiter refused: {} ({})", self.message, self.code)
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match &cli.command {
        Commands::Status => cmd_status(&cli).await,
        Commands::Info => cmd_info(&cli).await,
        Commands::Priority { value, timeout } => cmd_priority(&cli, *value, *timeout).await,
        Commands::Set { name, op, args } => cmd_set(&cli, name, op, args).await,
        Commands::Switch { target } => cmd_switch(&cli, target).await,
        Commands::Monitor => cmd_monitor(&cli).await,
    }
}

async fn cmd_status(cli: &Cli) -> Result<()> {
    let mut session = Session::connect(cli).await?;
    session.send("status_info").await?;
    let (lines, completion) = session.collect_until_completion().await?;
    completion.into_result()?;

    let mut state_word = None;
    let mut bop_word = None;
    for line in &lines {
        if let Some(rest) = line.strip_prefix("S ") {
            state_word = rest.trim().parse::<u32>().ok();
        } else if let Some(rest) = line.strip_prefix("BOP ") {
            bop_word = rest.trim().parse::<u32>().ok();
        }
    }
    let Some(word) = state_word else { bail!("no status in reply") };

    if cli.json {
        println!(
            "{}",
            serde_json::json!({
                "state": word,
                "describe": state::describe(word),
                "bop": bop_word,
            })
        );
    } else {
        let text = state::describe(word);
        if state::is_off(word) {
            println!("system {}", text.red());
        } else if state::is_standby(word) {
            println!("system {}", text.yellow());
        } else {
            println!("system {}", text.green());
        }
    }
    Ok(())
}

async fn cmd_info(cli: &Cli) -> Result<()> {
    let mut session = Session::connect(cli).await?;
    session.send("info").await?;
    let (lines, completion) = session.collect_until_completion().await?;
    completion.into_result()?;

    if cli.json {
        let mut devices = Vec::new();
        let mut users = Vec::new();
        for line in &lines {
            if line.starts_with("device ") {
                devices.push(line.clone());
            } else if line.starts_with("user ") {
                users.push(line.clone());
            }
        }
        println!("{}", serde_json::json!({ "devices": devices, "users": users }));
        return Ok(());
    }

    for line in &lines {
        if let Some(rest) = line.strip_prefix("device ") {
            println!("{} {}", "device".cyan(), rest);
        } else if let Some(rest) = line.strip_prefix("user ") {
            println!("{}   {}", "user".magenta(), rest);
        }
    }
    Ok(())
}

async fn cmd_priority(cli: &Cli, value: i32, timeout: Option<i64>) -> Result<()> {
    let mut session = Session::connect(cli).await?;
    match timeout {
        Some(secs) => session.send(&format!("prioritydeferred {value} {secs}")).await?,
        None => session.send(&format!("priority {value}")).await?,
    }
    let (lines, completion) = session.collect_until_completion().await?;
    completion.into_result()?;
    for line in lines {
        if let Some(rest) = line.strip_prefix("PRIORITY ") {
            println!("priority granted to connection {rest}");
        }
    }
    Ok(())
}

async fn cmd_set(cli: &Cli, name: &str, op: &str, args: &[String]) -> Result<()> {
    let mut session = Session::connect(cli).await?;
    session
        .send(&format!("set_value {name} {op} {}", args.join(" ")))
        .await?;
    session.wait_completion().await?.into_result()?;
    println!("{} {name}", "updated".green());
    Ok(())
}

async fn cmd_switch(cli: &Cli, target: &str) -> Result<()> {
    let mut session = Session::connect(cli).await?;
    session.send(target).await?;
    session.wait_completion().await?.into_result()?;
    println!("{} {target}", "switched".green());
    Ok(())
}

async fn cmd_monitor(cli: &Cli) -> Result<()> {
    let mut session = Session::connect(cli).await?;
    // Mirror the arbiter's published values as they stream in.
    let mut values = ValueStore::new();

    println!("{}", "following broadcasts, ^C to stop".dimmed());
    loop {
        let line = tokio::select! {
            line = session.read_line() => line?,
            _ = tokio::signal::ctrl_c() => break,
        };
        let Some(line) = line else {
            bail!("arbiter closed the connection")
        };

        if let Some(rest) = line.strip_prefix("S ") {
            if let Ok(word) = rest.trim().parse::<u32>() {
                println!("{} {}", "state".bold(), state::describe(word));
            }
            continue;
        }
        if line.starts_with("BOP ") || line.starts_with("PRIORITY ") {
            println!("{line}");
            continue;
        }

        // Value traffic keeps the local mirror current.
        let Ok((name, mut params)) = Params::parse_line(&line) else { continue };
        match name.as_str() {
            "metainfo" => {
                if let (Ok(tw), Ok(vname), Ok(desc)) = (
                    params.next_u32("type word"),
                    params.next_str("name"),
                    params.next_str("description"),
                ) {
                    let _ = values.declare(TypeWord(tw), &vname, &desc);
                }
            }
            "selmetainfo" => {
                if let (Ok(vname), Ok(label)) =
                    (params.next_str("name"), params.next_str("label"))
                {
                    let _ = values.add_label(&vname, &label);
                }
            }
            "value" => {
                if let Ok(vname) = params.next_str("name") {
                    if values.update_from_wire(&vname, &mut params).is_ok() {
                        if let Some(entry) = values.get(&vname) {
                            match entry.selected_label() {
                                Some(label) => println!("{} = {label}", vname.cyan()),
                                None => println!("{} = {:?}", vname.cyan(), entry.data),
                            }
                        }
                    }
                }
            }
            _ => {}
        }
    }
    Ok(())
}
