use colored::Colorize;
use std::time::{SystemTime, UNIX_EPOCH};
use switchyard_api::{GetGroupRespSchema, ProviderSchema, RouteRespSchema};
use tabular::{Row, Table};

pub(super) fn print_groups(groups: &[GetGroupRespSchema]) {
    for entry in groups {
        println!(
            "{} ({}): {}",
            entry.name.bold().green(),
            entry.strategy,
            entry.selected.blue()
        );
        let mut table = Table::new("  {:<} {:<} {:>}");
        for p in &entry.list {
            table.add_row(
                Row::new()
                    .with_cell(p.name.as_str())
                    .with_cell(p.proto.as_str())
                    .with_cell(p.latency.as_deref().unwrap_or("-")),
            );
        }
        print!("{}", table);
    }
}

pub(super) fn print_providers(providers: &[ProviderSchema]) {
    if providers.is_empty() {
        return;
    }
    let mut table = Table::new("{:<} {:<} {:<} {:>} {:>}");
    table.add_row(
        Row::new()
            .with_cell("Provider")
            .with_cell("Kind")
            .with_cell("Vehicle")
            .with_cell("Size")
            .with_cell("Updated"),
    );
    for p in providers {
        table.add_row(
            Row::new()
                .with_cell(p.name.as_str())
                .with_cell(p.kind.as_str())
                .with_cell(p.vehicle.as_str())
                .with_cell(p.size)
                .with_cell(p.updated_at.map_or("never".to_string(), pretty_age)),
        );
    }
    println!("{}", table);
}

pub(super) fn print_route(dst: &str, result: &RouteRespSchema) {
    println!("{}", route_line(dst, result));
}

fn route_line(dst: &str, result: &RouteRespSchema) -> String {
    format!(
        "{} [{}] {} => {}",
        dst.cyan(),
        result.rule.italic(),
        result.target,
        result.chain.join(" -> ").bold()
    )
}

fn pretty_age(updated_at: u64) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(updated_at);
    let secs = now.saturating_sub(updated_at);
    if secs < 60 {
        format!("{secs}s ago")
    } else if secs < 3600 {
        format!("{}m ago", secs / 60)
    } else {
        format!("{}h ago", secs / 3600)
    }
}

#[test]
fn test_route_line() {
    colored::control::set_override(false);
    let result = RouteRespSchema {
        proxy: "jp-01".to_string(),
        chain: vec!["jp-01".to_string(), "hk-01".to_string()],
        target: "Relay".to_string(),
        rule: "DOMAIN-SUFFIX,example.com".to_string(),
    };
    assert_eq!(
        route_line("www.example.com:443", &result),
        "www.example.com:443 [DOMAIN-SUFFIX,example.com] Relay => jp-01 -> hk-01"
    );
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs();
    assert_eq!(pretty_age(now - 7200), "2h ago");
}
