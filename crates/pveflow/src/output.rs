//! 計画・実行結果・検証結果の表示

use colored::{ColoredString, Colorize};
use pveflow_cloud::{ActionType, CheckResult, Phase, Plan, ReconciliationRecord, RunReport};
use pveflow_core::DesiredStateModel;

fn action_symbol(action_type: ActionType) -> &'static str {
    match action_type {
        ActionType::Create => "+",
        ActionType::Update => "~",
        ActionType::Replace => "-/+",
        ActionType::Delete => "-",
        ActionType::NoOp => "=",
    }
}

fn colorize_action(action_type: ActionType, text: &str) -> ColoredString {
    match action_type {
        ActionType::Create => text.green(),
        ActionType::Update => text.yellow(),
        ActionType::Replace => text.magenta(),
        ActionType::Delete => text.red(),
        ActionType::NoOp => text.dimmed(),
    }
}

/// 実行計画を表示
pub fn print_plan(plan: &Plan) {
    println!();
    println!("{}", "実行計画:".bold());
    if plan.actions.is_empty() {
        println!("  (対象リソースなし)");
    }
    for action in &plan.actions {
        let symbol = action_symbol(action.action_type);
        println!(
            "  {} {}",
            colorize_action(action.action_type, symbol).bold(),
            colorize_action(action.action_type, &action.resource_id.to_string())
        );
        for change in &action.changes {
            println!("      {}", change.to_string().dimmed());
        }
    }
    println!();
    println!("{}", plan.summary());
    if !plan.has_changes {
        println!("{}", "✓ 変更はありません".green());
    }
}

fn phase_label(phase: Phase) -> ColoredString {
    let text = phase.to_string();
    match phase {
        Phase::Applied | Phase::Destroyed => text.green(),
        Phase::Failed | Phase::RolledBack => text.red().bold(),
        Phase::Planned => text.dimmed(),
        Phase::Applying | Phase::Destroying => text.yellow(),
    }
}

/// 1リソース分の結果行
fn record_line(record: &ReconciliationRecord) -> String {
    let mut line = format!(
        "{:<22} {}",
        record.resource_id.to_string(),
        phase_label(record.phase)
    );
    if let Some(action) = &record.action {
        line.push_str(&format!(" ({})", action.action_type));
    }
    if let Some(address) = &record.address {
        line.push_str(&format!(" {}", address.cyan()));
    }
    if let Some(cause) = &record.skipped_due_to {
        line.push_str(&format!(" - {} の失敗によりスキップ", cause));
    } else if let Some(detail) = &record.error_detail {
        line.push_str(&format!(" - {}", detail));
        if let Some(task) = &record.last_task_id {
            line.push_str(&format!(" [{}]", task.dimmed()));
        }
    }
    line
}

/// 実行結果を表示
pub fn print_report(report: &RunReport) {
    println!();
    println!(
        "{}",
        format!("実行結果 ({} / {}):", report.environment, report.mode).bold()
    );
    for record in &report.records {
        println!("  {}", record_line(record));
    }

    let elapsed = report.finished_at - report.started_at;
    println!();
    println!("{}（{}秒）", report.plan_summary(), elapsed.num_seconds());

    let failed = report.failed_count();
    if failed == 0 {
        println!("{}", "✓ 完了しました".green().bold());
    } else {
        eprintln!(
            "{}",
            format!("✗ {}個のリソースが失敗しました", failed).red().bold()
        );
    }
}

/// 検証結果を表示
pub fn print_checks(results: &[CheckResult]) {
    for result in results {
        if result.passed {
            println!("  {} {} {}", "✓".green(), result.name, result.detail.dimmed());
        } else {
            println!("  {} {} {}", "✗".red(), result.name.red(), result.detail);
        }
    }
    let failed = results.iter().filter(|r| !r.passed).count();
    println!();
    if failed == 0 {
        println!(
            "{}",
            format!("✓ {}件のチェックに合格しました", results.len())
                .green()
                .bold()
        );
    } else {
        eprintln!(
            "{}",
            format!("✗ {}/{}件のチェックが失敗しました", failed, results.len())
                .red()
                .bold()
        );
    }
}

/// 検証済みモデルのサマリーを表示
pub fn print_model(model: &DesiredStateModel) {
    let topology = model.topology();
    println!(
        "環境: {} (node: {}, profile: {})",
        model.environment().cyan(),
        model.node(),
        model.profile()
    );
    println!(
        "  ゾーン: {} ({})",
        topology.zone.name.cyan(),
        topology.zone.zone_type
    );
    println!("  VNet: {}個", topology.vnets.len());
    for vnet in topology.vnets.values() {
        let dhcp = vnet
            .subnet
            .dhcp
            .as_ref()
            .map(|range| format!(", DHCP {}-{}", range.start, range.end))
            .unwrap_or_default();
        println!(
            "    - {} {} (gw {}{}{})",
            vnet.name.cyan(),
            vnet.subnet.cidr,
            vnet.subnet.gateway,
            dhcp,
            if vnet.subnet.snat { ", SNAT" } else { "" }
        );
    }

    let management = model.management();
    println!(
        "  管理ノード: {} (CT {}, {})",
        management.hostname.cyan(),
        management.id,
        management.network.ip
    );

    println!("  VM: {}個", model.fleet().len());
    for member in model.fleet().values() {
        let depends = if member.depends_on.is_empty() {
            String::new()
        } else {
            format!(
                ", depends-on: {}",
                member
                    .depends_on
                    .iter()
                    .map(String::as_str)
                    .collect::<Vec<_>>()
                    .join(", ")
            )
        };
        println!(
            "    - {} (VM {}, {}{})",
            member.name.cyan(),
            member.vmid,
            member.network.ip,
            depends
        );
    }
    println!("  リソース合計: {}個", model.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use pveflow_cloud::Action;
    use pveflow_core::ResourceId;

    #[test]
    fn test_action_symbols() {
        assert_eq!(action_symbol(ActionType::Create), "+");
        assert_eq!(action_symbol(ActionType::Replace), "-/+");
        assert_eq!(action_symbol(ActionType::NoOp), "=");
    }

    #[test]
    fn test_record_line_names_root_cause() {
        colored::control::set_override(false);

        let container = ResourceId::container(200);
        let mut record = ReconciliationRecord::planned(ResourceId::vm(301));
        record.phase = Phase::Failed;
        record.skipped_due_to = Some(container);
        record.error_detail = Some("dependency failed".to_string());

        let line = record_line(&record);
        assert!(line.contains("vm/301"), "{}", line);
        assert!(line.contains("failed"));
        assert!(line.contains("container/200 の失敗によりスキップ"));
        assert!(!line.contains("dependency failed"));
    }

    #[test]
    fn test_record_line_shows_action_and_address() {
        colored::control::set_override(false);

        let id = ResourceId::container(200);
        let mut record = ReconciliationRecord::planned(id.clone());
        record.phase = Phase::Applied;
        record.action = Some(Action::no_op(&id, "unchanged"));
        record.address = Some("10.100.1.10".to_string());

        let line = record_line(&record);
        assert!(line.contains("applied (no-op) 10.100.1.10"), "{}", line);
    }
}
