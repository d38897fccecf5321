//! Terminal output for the admin binary.

use capsched_capacity::{BindingSummary, NodeSummary, Resources};
use colored::Colorize;
use serde::Serialize;
use tabled::{Table, Tabled};

#[derive(Debug, Clone, Copy, Default)]
pub enum OutputFormat {
    #[default]
    Table,
    Json,
}

pub fn print_output<T: Serialize + Tabled>(data: &[T], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            if data.is_empty() {
                println!("{}", "No items found.".dimmed());
            } else {
                println!("{}", Table::new(data));
            }
        }
        OutputFormat::Json => match serde_json::to_string_pretty(data) {
            Ok(json) => println!("{json}"),
            Err(e) => print_error(&format!("failed to encode output: {e}")),
        },
    }
}

pub fn print_success(message: &str) {
    println!("{} {}", "Success:".green().bold(), message);
}

pub fn print_info(message: &str) {
    println!("{} {}", "Info:".blue().bold(), message);
}

pub fn print_error(message: &str) {
    eprintln!("{} {}", "Error:".red().bold(), message);
}

#[derive(Debug, Clone, Serialize, Tabled)]
pub struct NodeView {
    #[tabled(rename = "ID")]
    pub node: String,

    #[tabled(rename = "Hostname")]
    pub hostname: String,

    #[tabled(rename = "Status")]
    pub status: String,

    #[tabled(rename = "Compute")]
    pub is_compute: bool,

    #[tabled(rename = "CPU free/total")]
    pub cpu: String,

    #[tabled(rename = "RAM free/total")]
    pub ram: String,

    #[tabled(rename = "Disk free/total")]
    pub disk: String,

    #[tabled(rename = "VMs")]
    pub vms: usize,

    #[tabled(rename = "DCs")]
    pub dcs: usize,
}

impl From<NodeSummary> for NodeView {
    fn from(s: NodeSummary) -> Self {
        let [cpu, ram, disk] = axes(s.free, s.total);
        Self {
            node: s.node.to_string(),
            hostname: s.hostname,
            status: s.status.to_string(),
            is_compute: s.is_compute,
            cpu,
            ram,
            disk,
            vms: s.vms,
            dcs: s.dcs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Tabled)]
pub struct BindingView {
    #[tabled(rename = "DC")]
    pub dc: String,

    #[tabled(rename = "Hostname")]
    pub hostname: String,

    #[tabled(rename = "Strategy")]
    pub strategy: String,

    #[tabled(rename = "Priority")]
    pub priority: i32,

    #[tabled(rename = "CPU free/total")]
    pub cpu: String,

    #[tabled(rename = "RAM free/total")]
    pub ram: String,

    #[tabled(rename = "Disk free/total")]
    pub disk: String,

    #[tabled(rename = "VMs")]
    pub vms: usize,
}

impl From<BindingSummary> for BindingView {
    fn from(s: BindingSummary) -> Self {
        let [cpu, ram, disk] = axes(s.free, s.total);
        Self {
            dc: s.dc.to_string(),
            hostname: s.hostname,
            strategy: s.strategy.to_string(),
            priority: s.priority,
            cpu,
            ram,
            disk,
            vms: s.vms,
        }
    }
}

fn axes(free: Resources, total: Resources) -> [String; 3] {
    [
        format!("{}/{}", free.cpu, total.cpu),
        format!("{}/{}", free.ram, total.ram),
        format!("{}/{}", free.disk, total.disk),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_axes_keep_negative_free() {
        let [cpu, ram, disk] = axes(Resources::new(-1, 512, 0), Resources::new(4, 4096, 100));
        assert_eq!(cpu, "-1/4");
        assert_eq!(ram, "512/4096");
        assert_eq!(disk, "0/100");
    }
}
