use shared::{
    domain::{Group, Worksheet},
    protocol::GroupContextEvent,
};
use terminal_integration::{TerminalGroup, TerminalWorksheet};

pub fn render_worksheet(worksheet: &TerminalWorksheet) -> Worksheet {
    Worksheet {
        id: worksheet.id.clone(),
        name: worksheet.name.clone(),
        is_active: worksheet.is_active,
        securities: worksheet
            .securities
            .iter()
            .map(|security| security.ticker.clone())
            .collect(),
    }
}

/// Groups that never carried a value render with an empty one.
pub fn render_group(group: &TerminalGroup) -> Group {
    Group {
        name: group.name.clone(),
        kind: group.group_type.clone(),
        value: group.value.clone().unwrap_or_default(),
    }
}

pub fn render_groups(groups: &[TerminalGroup]) -> Vec<Group> {
    groups.iter().map(render_group).collect()
}

pub fn render_group_event(
    group: Option<&TerminalGroup>,
    groups: Option<&[TerminalGroup]>,
    cookie: Option<&str>,
    external_source: bool,
) -> GroupContextEvent {
    GroupContextEvent {
        group: group.map(render_group),
        groups: groups.map(render_groups),
        cookie: cookie.map(str::to_string),
        external_source,
    }
}

#[cfg(test)]
mod tests {
    use terminal_integration::TerminalSecurity;

    use super::*;

    #[test]
    fn worksheet_flattens_securities_to_tickers() {
        let rendered = render_worksheet(&TerminalWorksheet {
            id: "ws-9".into(),
            name: "Tech".into(),
            is_active: true,
            securities: vec![
                TerminalSecurity::new("IBM US Equity"),
                TerminalSecurity::new("MSFT US Equity"),
            ],
        });
        assert_eq!(rendered.securities, vec!["IBM US Equity", "MSFT US Equity"]);

        let json = serde_json::to_value(&rendered).expect("json");
        assert_eq!(json["isActive"], true);
    }

    #[test]
    fn valueless_group_renders_empty_value() {
        let group = render_group(&TerminalGroup {
            name: "Group-B".into(),
            group_type: "security".into(),
            value: None,
        });
        assert_eq!(group.value, "");
        assert_eq!(group.kind, "security");
    }
}
