mod cli;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use clap::Parser;
use dialoguer::{theme::ColorfulTheme, Confirm, Input, Password};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Commands, FetchArgs, SetArgs};
use rest_migrate::prelude::*;
use rest_migrate::tree::{FieldType, PromptField};
use rest_migrate::types::{Indicator, TreeNodeRow};

/// Prompts on the terminal.
struct TerminalDialogs;

#[async_trait]
impl DialogService for TerminalDialogs {
    async fn prompt(&self, fields: &[PromptField]) -> Option<BTreeMap<String, String>> {
        let fields = fields.to_vec();
        tokio::task::spawn_blocking(move || {
            let theme = ColorfulTheme::default();
            let mut values = BTreeMap::new();
            for field in fields {
                let value = match field.fieldtype {
                    FieldType::Data => Input::<String>::with_theme(&theme)
                        .with_prompt(&field.label)
                        .allow_empty(!field.reqd)
                        .interact_text()
                        .ok()?,
                    FieldType::Password => Password::with_theme(&theme)
                        .with_prompt(&field.label)
                        .allow_empty_password(true)
                        .interact()
                        .ok()?,
                    FieldType::Check => {
                        let yes =
                            Confirm::with_theme(&theme).with_prompt(&field.label).interact().ok()?;
                        if yes { "1".to_string() } else { "0".to_string() }
                    }
                };
                values.insert(field.fieldname, value);
            }
            Some(values)
        })
        .await
        .ok()
        .flatten()
    }

    fn msgprint(&self, notice: Notice) {
        match notice.indicator {
            Indicator::Green => println!("{}", notice),
            Indicator::Red => eprintln!("{}", notice),
        }
    }

    fn throw(&self, message: &str) {
        eprintln!("Error: {}", message);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rest_migrate=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(url) = cli.database_url {
        settings.database_url = Some(url);
    }
    let app = Arc::new(RestMigrate::connect(settings, true).await?);

    match cli.command {
        Commands::Tree { parent } => print_tree(app, parent).await?,
        Commands::Add { segment_name, group, parent } => {
            let node = app.add_node(&segment_name, group, parent.as_deref()).await?;
            println!("{}", node.name);
        }
        Commands::Remove { name } => {
            app.delete_node(&name).await?;
            println!("Deleted {}", name);
        }
        Commands::Set(args) => set_node(&app, args).await?,
        Commands::Param { name, query, header } => {
            let params: Vec<MapParam> = query
                .into_iter()
                .map(|(key, value)| MapParam { param_type: ParamType::UrlQuery, key, value })
                .chain(header.into_iter().map(|(key, value)| MapParam {
                    param_type: ParamType::Header,
                    key,
                    value,
                }))
                .collect();
            app.set_params(&name, &params).await?;
            println!("{} params set on {}", params.len(), name);
        }
        Commands::Candidates { name, field } => {
            let node = app.get_node(&name).await?;
            for value in app.field_candidates(&field, &node).await? {
                println!("{}", value);
            }
        }
        Commands::Import(args) => fetch(app, args, ToolbarAction::ApiImport).await?,
        Commands::Show(args) => fetch(app, args, ToolbarAction::ShowData).await?,
        Commands::Schema { path } => {
            let count = app.load_schema_file(&path).await?;
            println!("Registered {} doctypes", count);
        }
        Commands::Docs { doctype } => {
            let docs = app.list_documents(&doctype).await?;
            println!("{}", serde_json::to_string_pretty(&docs)?);
        }
        Commands::Export { out } => {
            let json = app.export_fixture_json().await?;
            match out {
                Some(path) => tokio::fs::write(&path, json).await?,
                None => println!("{}", json),
            }
        }
        Commands::Load { path } => {
            let text = tokio::fs::read_to_string(&path).await?;
            let count = app.import_fixture_json(&text).await?;
            println!("Loaded {} nodes", count);
        }
    }
    Ok(())
}

async fn print_tree(app: Arc<RestMigrate>, parent: Option<String>) -> Result<()> {
    let controller = TreeController::new(app.clone(), TerminalDialogs);
    let top = match parent {
        Some(name) => {
            let node = app.get_node(&name).await?;
            TreeNode::from(TreeNodeRow {
                value: node.name,
                label: Some(node.segment_name),
                expandable: Some(node.is_group),
            })
        }
        None => TreeNode::root(),
    };
    let mut stack = vec![(top, 0usize)];
    while let Some((node, depth)) = stack.pop() {
        let marker = if node.expandable { "/" } else { "" };
        println!("{}{}{}", "  ".repeat(depth), get_label(&node), marker);
        if node.expandable {
            let children = controller
                .load_children(Some(&node))
                .await
                .map_err(|f| anyhow::anyhow!("{}", f))?;
            stack.extend(children.into_iter().rev().map(|c| (c, depth + 1)));
        }
    }
    Ok(())
}

async fn set_node(app: &RestMigrate, args: SetArgs) -> Result<()> {
    let mut node = app.get_node(&args.name).await?;
    if args.clear {
        node.data_field = None;
        node.target_dt = None;
        node.target_df = None;
        node.convert_method = None;
    }
    if let Some(v) = args.data_field {
        node.data_field = Some(v);
    }
    if let Some(v) = args.target_dt {
        node.target_dt = Some(v);
    }
    if let Some(v) = args.target_df {
        node.target_df = Some(v);
    }
    if let Some(v) = args.convert {
        node.convert_method = Some(v);
    }
    if let Some(v) = args.keep_existing {
        node.keep_existing = v;
    }
    let node = app.save_node(node).await?;
    println!("{}", serde_json::to_string_pretty(&node)?);
    Ok(())
}

/// Run an import or data preview. With `--username` the credentials go out
/// on the first request; otherwise the tree's retry flow prompts on demand.
async fn fetch(app: Arc<RestMigrate>, args: FetchArgs, action: ToolbarAction) -> Result<()> {
    if let Some(username) = args.username {
        let credentials = Credentials {
            auth: args.auth,
            username,
            password: args.password.unwrap_or_default(),
        };
        return match action {
            ToolbarAction::ShowData => {
                let records = app.get_data(&args.name, Some(&credentials)).await?;
                println!("{}", serde_json::to_string_pretty(&records)?);
                Ok(())
            }
            ToolbarAction::ApiImport => {
                let mut progress = |p: ImportProgress| {
                    tracing::debug!(
                        percent = p.percent,
                        doctype = ?p.doctype,
                        docname = ?p.docname,
                        "progress"
                    );
                };
                let report = app
                    .import_data_with_progress(&args.name, Some(&credentials), &mut progress)
                    .await?;
                print_report(&report);
                Ok(())
            }
        };
    }

    let node = app.get_node(&args.name).await?;
    let tree_node = TreeNode::from(TreeNodeRow {
        value: node.name.clone(),
        label: Some(node.segment_name),
        expandable: Some(node.is_group),
    });
    let controller = TreeController::new(app, TerminalDialogs);
    match controller.click(action, &tree_node).await {
        RetryState::Success(_) | RetryState::Retried(Ok(_)) => {
            if action == ToolbarAction::ApiImport {
                println!("Imported {}", node.name);
            }
            Ok(())
        }
        RetryState::Cancelled if node.is_group => {
            bail!("{} is only valid on a data field", action.label())
        }
        RetryState::Cancelled => bail!("cancelled"),
        state => bail!("{} failed for {} ({})", action.label(), node.name, state_name(&state)),
    }
}

fn state_name(state: &RetryState) -> &'static str {
    match state {
        RetryState::TerminalError(_) => "error",
        RetryState::Retried(Err(_)) => "retry failed",
        _ => "incomplete",
    }
}

fn print_report(report: &ImportReport) {
    let dialogs = TerminalDialogs;
    for notice in &report.messages {
        dialogs.msgprint(notice.clone());
    }
    println!("{} records, {} documents written", report.records, report.documents);
}
