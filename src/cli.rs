//! CLI flags

/// Parsed command-line options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliOptions {
    pub config_path: String,
    pub control_addr: String,
    pub balancer_addr: Option<String>,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            config_path: "config.json".to_string(),
            control_addr: "0.0.0.0:8080".to_string(),
            balancer_addr: None,
        }
    }
}

fn print_help() {
    eprintln!("Usage: mcproxy [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("  -config <PATH>      Path to config.json (default: config.json)");
    eprintln!("  -control <ADDR>     Control panel address (default: 0.0.0.0:8080)");
    eprintln!("  -balancer <ADDR>    Load balancer address (e.g. 0.0.0.0:25565)");
    eprintln!("  -h, --help          Show this help");
    eprintln!("  -V, --version       Show version");
}

/// Parse process arguments. Exits on `--help`/`--version`.
pub fn parse() -> CliOptions {
    let args: Vec<String> = std::env::args().skip(1).collect();
    match parse_args(&args) {
        Ok(options) => options,
        Err(message) => {
            eprintln!("{message}");
            print_help();
            std::process::exit(2);
        }
    }
}

pub fn parse_args(args: &[String]) -> Result<CliOptions, String> {
    let mut options = CliOptions::default();

    let mut i = 0;
    while i < args.len() {
        let arg = args[i].as_str();
        let flag = arg.trim_start_matches('-');

        // accept -flag value, --flag value and -flag=value forms
        let (name, inline) = match flag.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (flag, None),
        };

        let mut take_value = |i: &mut usize| -> Result<String, String> {
            if let Some(value) = inline.clone() {
                return Ok(value);
            }
            *i += 1;
            args.get(*i)
                .cloned()
                .ok_or_else(|| format!("missing value for -{name}"))
        };

        match name {
            "config" => options.config_path = take_value(&mut i)?,
            "control" => options.control_addr = take_value(&mut i)?,
            "balancer" => {
                let addr = take_value(&mut i)?;
                if !addr.is_empty() {
                    options.balancer_addr = Some(addr);
                }
            }
            "h" | "help" => {
                print_help();
                std::process::exit(0);
            }
            "V" | "version" => {
                println!("mcproxy {}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            other => return Err(format!("unknown option: {other}")),
        }
        i += 1;
    }

    Ok(options)
}
