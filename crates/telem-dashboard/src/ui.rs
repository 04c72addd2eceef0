use crate::activity::{ActivityTracker, ClientEntityState};
use crate::client::{ConnectionState, Phase};
use ratatui::{
    layout::{Constraint, Direction, Layout},
    style::{Color, Modifier, Style},
    text::{Line, Span, Text},
    widgets::{Block, Borders, Cell, Paragraph, Row, Table},
    Frame,
};
use telem_core::Liveness;

#[derive(Clone, Copy)]
struct Theme {
    bg: Color,
    surface: Color,
    border: Color,
    title: Color,
    text: Color,
    muted: Color,
    accent: Color,
    ok: Color,
    warn: Color,
    critical: Color,
}

fn theme() -> Theme {
    Theme {
        bg: Color::Rgb(11, 18, 32),
        surface: Color::Rgb(17, 26, 46),
        border: Color::Rgb(71, 85, 105),
        title: Color::Rgb(191, 219, 254),
        text: Color::Rgb(226, 232, 240),
        muted: Color::Rgb(148, 163, 184),
        accent: Color::Rgb(56, 189, 248),
        ok: Color::Rgb(34, 197, 94),
        warn: Color::Rgb(245, 158, 11),
        critical: Color::Rgb(239, 68, 68),
    }
}

/// Everything the screen shows, borrowed from the running app.
pub struct View<'a> {
    pub connection: ConnectionState,
    pub visible: bool,
    pub torn_down: bool,
    pub ws_url: &'a str,
    pub rest_base: &'a str,
    pub tracker: &'a ActivityTracker,
    pub note: Option<&'a str>,
}

pub fn render_ui(frame: &mut Frame, view: &View) {
    let theme = theme();
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(4), Constraint::Min(0)])
        .split(frame.size());
    frame.render_widget(render_header(view, theme), layout[0]);
    frame.render_widget(render_entities(view.tracker, theme), layout[1]);
}

fn phase_chip(view: &View, theme: Theme) -> Span<'static> {
    let (label, color) = if view.torn_down {
        ("stopped".to_string(), theme.muted)
    } else if !view.visible {
        ("paused".to_string(), theme.muted)
    } else {
        let color = match view.connection.phase {
            Phase::Connected => theme.ok,
            Phase::Connecting => theme.warn,
            Phase::Disconnected => theme.critical,
        };
        (view.connection.phase.as_str().to_string(), color)
    };
    Span::styled(
        format!(" {label} "),
        Style::default()
            .fg(theme.bg)
            .bg(color)
            .add_modifier(Modifier::BOLD),
    )
}

fn render_header(view: &View, theme: Theme) -> Paragraph<'static> {
    let last_update = view
        .tracker
        .last_update()
        .map(|at| at.format("%H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    let status = Line::from(vec![
        phase_chip(view, theme),
        Span::styled(
            format!(
                "  Attempts: {}  Last update: {}  Active: {}/{}",
                view.connection.reconnect_attempts,
                last_update,
                view.tracker.active_count(),
                view.tracker.len()
            ),
            Style::default().fg(theme.text),
        ),
    ]);
    let detail = match view.note {
        Some(note) => Span::styled(note.to_string(), Style::default().fg(theme.warn)),
        None => Span::styled(
            format!("Stream: {}  API: {}", view.ws_url, view.rest_base),
            Style::default().fg(theme.muted),
        ),
    };

    Paragraph::new(Text::from(vec![status, Line::from(detail)]))
        .style(Style::default().fg(theme.text).bg(theme.bg))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .border_style(Style::default().fg(theme.border))
                .title(Span::styled(
                    "Telemetry",
                    Style::default()
                        .fg(theme.title)
                        .add_modifier(Modifier::BOLD),
                )),
        )
}

fn entity_row(entity: &ClientEntityState, theme: Theme) -> Row<'static> {
    let liveness_color = match entity.liveness {
        Liveness::Online => theme.ok,
        Liveness::Offline => theme.critical,
    };
    let stage = entity
        .last_known_stage
        .map(|stage| stage.as_str())
        .unwrap_or("-");
    let (marker, marker_style) = if entity.is_active {
        ("●", Style::default().fg(theme.accent).add_modifier(Modifier::BOLD))
    } else {
        ("○", Style::default().fg(theme.muted))
    };
    Row::new(vec![
        Cell::from(Span::styled(marker, marker_style)),
        Cell::from(entity.name.clone()),
        Cell::from(entity.address.clone()),
        Cell::from(Span::styled(
            entity.liveness.as_str(),
            Style::default().fg(liveness_color),
        )),
        Cell::from(stage),
        Cell::from(format!("{:>7.1}", entity.throughput)),
    ])
}

fn render_entities(tracker: &ActivityTracker, theme: Theme) -> Table<'static> {
    let header = Row::new(vec!["", "Device", "Address", "Status", "Stage", "Mbps"])
        .style(Style::default().fg(theme.muted).add_modifier(Modifier::BOLD));
    let rows: Vec<Row> = tracker
        .entities()
        .iter()
        .map(|entity| entity_row(entity, theme))
        .collect();
    Table::new(
        rows,
        [
            Constraint::Length(2),
            Constraint::Min(16),
            Constraint::Length(15),
            Constraint::Length(8),
            Constraint::Length(8),
            Constraint::Length(8),
        ],
    )
    .header(header)
    .style(Style::default().fg(theme.text).bg(theme.surface))
    .block(
        Block::default()
            .borders(Borders::ALL)
            .border_style(Style::default().fg(theme.border))
            .title(Span::styled(
                "Devices",
                Style::default()
                    .fg(theme.title)
                    .add_modifier(Modifier::BOLD),
            )),
    )
}
