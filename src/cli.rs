use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Map a REST API onto a target schema and import its records
#[derive(Parser)]
#[command(name = "rest-migrate")]
#[command(about = "Build integration maps for REST APIs and import their data", long_about = None)]
pub struct Cli {
    /// Config file (defaults to the user config directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
    /// Database URL, overriding the config file
    #[arg(long, global = true)]
    pub database_url: Option<String>,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the integration map tree
    Tree {
        /// Start below this node instead of the top
        parent: Option<String>,
    },
    /// Add a URL segment or data field
    Add {
        segment_name: String,
        /// Add a URL path segment rather than a data field
        #[arg(short, long)]
        group: bool,
        /// Parent node; omit to add a new API root
        #[arg(short, long)]
        parent: Option<String>,
    },
    /// Delete a node without children
    Remove { name: String },
    /// Change the mapping of a node
    Set(SetArgs),
    /// Replace the request params of a node
    Param {
        name: String,
        /// URL query parameter as key=value
        #[arg(short, long = "query", value_parser = parse_pair)]
        query: Vec<(String, String)>,
        /// Request header as key=value
        #[arg(short = 'H', long = "header", value_parser = parse_pair)]
        header: Vec<(String, String)>,
    },
    /// List the values a form field of a node can take
    Candidates {
        name: String,
        /// data_field or target_df
        field: String,
    },
    /// Import the records of a data field
    Import(FetchArgs),
    /// Print the records fetched for a data field
    Show(FetchArgs),
    /// Register doctypes from a TOML schema file
    Schema { path: PathBuf },
    /// List imported documents of a doctype
    Docs { doctype: String },
    /// Write the whole map as JSON
    Export {
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Load a map exported with `export`
    Load { path: PathBuf },
}

#[derive(Args)]
pub struct SetArgs {
    pub name: String,
    /// Data field the URL segment takes its values from
    #[arg(long)]
    pub data_field: Option<String>,
    #[arg(long)]
    pub target_dt: Option<String>,
    #[arg(long)]
    pub target_df: Option<String>,
    /// Conversion such as `.lower()` or `int`
    #[arg(long)]
    pub convert: Option<String>,
    /// Keep documents that already exist (API roots only)
    #[arg(long)]
    pub keep_existing: Option<bool>,
    /// Clear every mapping field before applying the others
    #[arg(long)]
    pub clear: bool,
}

#[derive(Args)]
pub struct FetchArgs {
    pub name: String,
    /// Send credentials on the first request instead of waiting for a challenge
    #[arg(short, long)]
    pub username: Option<String>,
    #[arg(short, long, requires = "username")]
    pub password: Option<String>,
    /// Authentication scheme for --username
    #[arg(long, default_value = "Basic")]
    pub auth: String,
}

fn parse_pair(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("expected key=value, got `{}`", s)),
    }
}
