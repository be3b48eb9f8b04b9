use crate::format::{format_relative, format_speed, format_traffic};
use crate::keybindings::{KeyCategory, get_all_keybindings, get_status_bar_keybindings};
use crate::reconciler::ConnectionStore;
use crate::stream::StreamMessage;
use crate::view::{self, ConnectionRow, SortColumn, SortState};
use chrono::Utc;
use ratatui::{
    Frame,
    layout::{Alignment, Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    text::{Line, Span},
    widgets::{Block, Borders, Cell, Clear, Paragraph, Row, Table, TableState},
};
use unicode_width::UnicodeWidthChar;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Connecting,
    Live,
    Closed,
}

impl FeedState {
    fn label(&self) -> &'static str {
        match self {
            FeedState::Connecting => "connecting",
            FeedState::Live => "live",
            FeedState::Closed => "closed",
        }
    }
}

pub struct AppState {
    pub store: ConnectionStore,
    pub rows: Vec<ConnectionRow>, // sorted + filtered, as displayed
    pub devices: Vec<(String, usize)>,
    pub device_filter: Option<String>,
    pub sort: SortState,
    pub table_state: TableState,
    pub selected_index: Option<usize>,
    pub show_help: bool,
    pub show_close_all_dialog: bool,
    pub status_message: String,
    pub feed_state: FeedState,
    pub controller_label: String,
}

impl AppState {
    pub fn new(keep_closed: bool, controller_label: String) -> Self {
        let mut table_state = TableState::default();
        table_state.select(None); // Nothing selected initially

        Self {
            store: ConnectionStore::new(keep_closed),
            rows: Vec::new(),
            devices: Vec::new(),
            device_filter: None,
            sort: SortState::default(),
            table_state,
            selected_index: None,
            show_help: false,
            show_close_all_dialog: false,
            status_message: String::from("clashtop started. Press 'h' for help."),
            feed_state: FeedState::Connecting,
            controller_label,
        }
    }

    /// Apply one message from the connection feed
    pub fn apply_message(&mut self, message: StreamMessage) {
        match message {
            StreamMessage::Data(snapshot) => {
                self.store.feed_snapshot(snapshot);
                self.feed_state = FeedState::Live;
                self.refresh_rows();
            }
            StreamMessage::Closed => {
                self.feed_state = FeedState::Closed;
                self.status_message =
                    "Connection feed closed by the controller. Restart to reconnect.".to_string();
            }
        }
    }

    /// Rebuild the displayed rows from the store, keeping the selected
    /// connection selected when it is still shown
    pub fn refresh_rows(&mut self) {
        let selected_id = self.get_selected_connection().map(|r| r.id.clone());

        let rows = view::build_rows(&self.store.connections());
        self.devices = view::device_counts(&rows);

        let stale_filter = self
            .device_filter
            .as_ref()
            .is_some_and(|device| !self.devices.iter().any(|(label, _)| label == device));
        if stale_filter {
            log::debug!("Filtered device has no connections left, clearing filter");
            self.device_filter = None;
        }

        let mut rows = view::filter_by_device(rows, self.device_filter.as_deref());
        self.sort.apply(&mut rows);
        self.rows = rows;

        let position = selected_id
            .and_then(|id| self.rows.iter().position(|r| r.id == id))
            .or_else(|| {
                // Clamp a stale selection to the end of the list
                self.selected_index
                    .filter(|_| !self.rows.is_empty())
                    .map(|index| index.min(self.rows.len() - 1))
            });
        self.selected_index = position;
        self.table_state.select(position);
    }

    pub fn toggle_keep_closed(&mut self) -> bool {
        let keep_closed = self.store.toggle_save();
        self.refresh_rows();
        self.status_message = if keep_closed {
            "Keeping closed connections".to_string()
        } else {
            "Closed connections discarded".to_string()
        };
        keep_closed
    }

    pub fn select_sort_column(&mut self, column: SortColumn) {
        self.sort.select(column);
        self.refresh_rows();
    }

    pub fn cycle_sort_column(&mut self) {
        self.select_sort_column(self.sort.column.next());
    }

    pub fn toggle_sort_direction(&mut self) {
        self.sort.toggle_direction();
        self.refresh_rows();
    }

    /// All -> each source device in order -> All
    pub fn cycle_device_filter(&mut self) {
        let next = match &self.device_filter {
            None => self.devices.first().map(|(label, _)| label.clone()),
            Some(current) => self
                .devices
                .iter()
                .position(|(label, _)| label == current)
                .and_then(|index| self.devices.get(index + 1))
                .map(|(label, _)| label.clone()),
        };
        self.device_filter = next;
        self.refresh_rows();

        self.status_message = match &self.device_filter {
            Some(device) => format!("Showing connections from {}", device),
            None => "Showing connections from all devices".to_string(),
        };
    }

    pub fn select_next(&mut self) {
        if self.rows.is_empty() {
            return;
        }

        let new_index = match self.selected_index {
            None => 0, // If nothing selected, select first item
            Some(idx) => (idx + 1) % self.rows.len(),
        };

        self.selected_index = Some(new_index);
        self.table_state.select(Some(new_index));
    }

    pub fn select_previous(&mut self) {
        if self.rows.is_empty() {
            return;
        }

        let new_index = match self.selected_index {
            None => 0, // If nothing selected, select first item
            Some(0) => self.rows.len() - 1,
            Some(idx) => idx - 1,
        };

        self.selected_index = Some(new_index);
        self.table_state.select(Some(new_index));
    }

    pub fn get_selected_connection(&self) -> Option<&ConnectionRow> {
        self.selected_index.and_then(|idx| self.rows.get(idx))
    }
}

pub fn draw_ui(f: &mut Frame, app: &mut AppState) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(3), // Header
            Constraint::Min(10),   // Connection table
            Constraint::Length(3), // Status bar
        ])
        .split(f.area());

    draw_header(f, chunks[0], app);
    draw_connection_table(f, chunks[1], app);
    draw_status_bar(f, chunks[2], app);

    if app.show_help {
        draw_help_overlay(f, f.area());
    }

    if app.show_close_all_dialog {
        draw_close_all_dialog(f, f.area());
    }
}

fn draw_header(f: &mut Frame, area: Rect, app: &AppState) {
    let totals = app.store.totals();
    let keep_closed = if app.store.keep_closed() { "[x]" } else { "[ ]" };
    let feed_color = match app.feed_state {
        FeedState::Live => Color::Green,
        FeedState::Connecting => Color::Yellow,
        FeedState::Closed => Color::Red,
    };
    let device = app.device_filter.as_deref().unwrap_or("all devices");

    let line = Line::from(vec![
        Span::styled(
            "Connections ",
            Style::default()
                .fg(Color::Cyan)
                .add_modifier(Modifier::BOLD),
        ),
        Span::raw(format!(
            "(Total: ↑ {} ↓ {})  ",
            format_traffic(totals.upload),
            format_traffic(totals.download)
        )),
        Span::styled(
            format!("{} Keep closed  ", keep_closed),
            Style::default().fg(Color::Yellow),
        ),
        Span::raw(format!("Device: {}  ", device)),
        Span::styled(
            format!("Feed: {}", app.feed_state.label()),
            Style::default().fg(feed_color),
        ),
    ]);

    let header = Paragraph::new(line).block(
        Block::default()
            .borders(Borders::ALL)
            .title(format!("clashtop - {}", app.controller_label)),
    );

    f.render_widget(header, area);
}

fn column_width(column: SortColumn) -> Constraint {
    match column {
        SortColumn::Host => Constraint::Min(24),
        SortColumn::Network => Constraint::Length(8),
        SortColumn::Type => Constraint::Length(10),
        SortColumn::Chains => Constraint::Length(24),
        SortColumn::Rule => Constraint::Length(18),
        SortColumn::Speed => Constraint::Length(24),
        SortColumn::Upload => Constraint::Length(11),
        SortColumn::Download => Constraint::Length(11),
        SortColumn::Time => Constraint::Length(18),
    }
}

/// Cut `text` to `max` terminal columns, marking the cut with an ellipsis
fn fit(text: &str, max: usize) -> String {
    let mut width = 0;
    let mut out = String::new();
    for ch in text.chars() {
        let w = ch.width().unwrap_or(0);
        if width + w > max.saturating_sub(1) {
            let rest: usize = text.chars().map(|c| c.width().unwrap_or(0)).sum();
            if rest <= max {
                return text.to_string();
            }
            out.push('…');
            return out;
        }
        width += w;
        out.push(ch);
    }
    out
}

fn cell_text(row: &ConnectionRow, column: SortColumn, now: chrono::DateTime<Utc>) -> String {
    match column {
        SortColumn::Host => row.host.clone(),
        SortColumn::Network => row.network.clone(),
        SortColumn::Type => row.kind.clone(),
        SortColumn::Chains => fit(&row.chains, 24),
        SortColumn::Rule => fit(&row.rule, 18),
        SortColumn::Speed => format_speed(row.upload_speed, row.download_speed),
        SortColumn::Upload => format_traffic(row.upload),
        SortColumn::Download => format_traffic(row.download),
        SortColumn::Time => format_relative(row.start, now),
    }
}

fn draw_connection_table(f: &mut Frame, area: Rect, app: &mut AppState) {
    let now = Utc::now();

    let header_cells = SortColumn::ALL.iter().enumerate().map(|(i, column)| {
        let mut title = format!("{} {}", i + 1, column.title());
        if *column == app.sort.column {
            title.push_str(app.sort.indicator());
        }
        Cell::from(title)
    });
    let header = Row::new(header_cells).style(Style::default().add_modifier(Modifier::BOLD));

    let rows = app.rows.iter().map(|row| {
        let style = if row.completed {
            Style::default().fg(Color::DarkGray)
        } else {
            Style::default().fg(Color::White)
        };
        let cells = SortColumn::ALL
            .iter()
            .map(|column| Cell::from(cell_text(row, *column, now)));
        Row::new(cells).style(style)
    });

    let widths: Vec<Constraint> = SortColumn::ALL.iter().map(|c| column_width(*c)).collect();

    let title = format!(
        "{} connection(s){}",
        app.rows.len(),
        if app.rows.len() != app.store.len() {
            format!(" of {}", app.store.len())
        } else {
            String::new()
        }
    );

    let table = Table::new(rows, widths)
        .header(header)
        .block(Block::default().borders(Borders::ALL).title(title))
        .highlight_style(
            Style::default()
                .bg(Color::DarkGray)
                .add_modifier(Modifier::BOLD),
        )
        .highlight_symbol("▶ ");

    f.render_stateful_widget(table, area, &mut app.table_state);
}

fn draw_status_bar(f: &mut Frame, area: Rect, app: &AppState) {
    // Auto-generate status bar from centralized keybindings
    let mut spans = vec![];

    for (i, (key, description)) in get_status_bar_keybindings().iter().enumerate() {
        if i > 0 {
            spans.push(Span::raw("  "));
        }
        spans.push(Span::styled(
            format!("[{}]", key),
            Style::default().fg(Color::Yellow),
        ));
        spans.push(Span::raw(format!(" {}", description)));
    }

    spans.push(Span::raw("  |  "));
    spans.push(Span::styled(
        &app.status_message,
        Style::default().fg(Color::Gray),
    ));

    let status =
        Paragraph::new(vec![Line::from(spans)]).block(Block::default().borders(Borders::ALL));

    f.render_widget(status, area);
}

fn draw_help_overlay(f: &mut Frame, area: Rect) {
    let mut help_text = vec![
        Line::from(""),
        Line::from(Span::styled(
            "clashtop - Keyboard Shortcuts",
            Style::default().add_modifier(Modifier::BOLD),
        )),
    ];

    let bindings = get_all_keybindings();
    for category in [
        KeyCategory::Navigation,
        KeyCategory::Table,
        KeyCategory::Actions,
        KeyCategory::System,
    ] {
        help_text.push(Line::from(""));
        help_text.push(Line::from(Span::styled(
            category.title(),
            Style::default().fg(Color::Yellow),
        )));
        for binding in bindings.iter().filter(|b| b.category == category) {
            help_text.push(Line::from(format!(
                "  {:12} - {}",
                binding.key, binding.description
            )));
        }
    }

    help_text.push(Line::from(""));
    help_text.push(Line::from("Press any key to close..."));

    let help = Paragraph::new(help_text)
        .style(Style::default().bg(Color::Black).fg(Color::White))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Help")
                .style(Style::default().fg(Color::Cyan)),
        );

    let help_area = centered_rect(60, 70, area);
    f.render_widget(Clear, help_area);
    f.render_widget(help, help_area);
}

fn draw_close_all_dialog(f: &mut Frame, area: Rect) {
    let text = vec![
        Line::from(""),
        Line::from("Close all active connections?"),
        Line::from(""),
        Line::from(Span::styled(
            "[Enter/y] Confirm  [Esc/n] Cancel",
            Style::default().fg(Color::DarkGray),
        )),
    ];

    let dialog = Paragraph::new(text)
        .alignment(Alignment::Center)
        .style(Style::default().bg(Color::Black).fg(Color::White))
        .block(
            Block::default()
                .borders(Borders::ALL)
                .title("Close All")
                .style(Style::default().fg(Color::Red)),
        );

    let dialog_area = centered_rect(50, 25, area);
    f.render_widget(Clear, dialog_area);
    f.render_widget(dialog, dialog_area);
}

fn centered_rect(percent_x: u16, percent_y: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - percent_y) / 2),
            Constraint::Percentage(percent_y),
            Constraint::Percentage((100 - percent_y) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - percent_x) / 2),
            Constraint::Percentage(percent_x),
            Constraint::Percentage((100 - percent_x) / 2),
        ])
        .split(popup_layout[1])[1]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Snapshot;
    use crate::model::tests::record;
    use ratatui::{Terminal, backend::TestBackend};

    fn snapshot(records: Vec<crate::model::ConnectionRecord>) -> StreamMessage {
        StreamMessage::Data(Snapshot {
            upload_total: 100,
            download_total: 200,
            connections: records,
        })
    }

    fn from_device(id: &str, device: &str, download: u64) -> crate::model::ConnectionRecord {
        let mut rec = record(id, 0, download);
        rec.metadata.source_ip = device.to_string();
        rec
    }

    #[test]
    fn test_apply_snapshot_builds_rows() {
        let mut app = AppState::new(false, "127.0.0.1:9090".to_string());
        assert_eq!(app.feed_state, FeedState::Connecting);

        app.apply_message(snapshot(vec![record("a", 1, 2), record("b", 3, 4)]));

        assert_eq!(app.feed_state, FeedState::Live);
        assert_eq!(app.rows.len(), 2);
        assert_eq!(app.store.totals().download, 200);
    }

    #[test]
    fn test_closed_message_marks_feed() {
        let mut app = AppState::new(false, String::new());
        app.apply_message(StreamMessage::Closed);
        assert_eq!(app.feed_state, FeedState::Closed);
    }

    #[test]
    fn test_keep_closed_toggle_purges_rows() {
        let mut app = AppState::new(true, String::new());
        app.apply_message(snapshot(vec![record("a", 1, 1), record("b", 1, 1)]));
        app.apply_message(snapshot(vec![record("b", 1, 1)]));
        assert_eq!(app.rows.len(), 2);
        assert!(app.rows.iter().any(|r| r.id == "a" && r.completed));

        assert!(!app.toggle_keep_closed());
        assert_eq!(app.rows.len(), 1);
        assert_eq!(app.rows[0].id, "b");
    }

    #[test]
    fn test_selection_follows_connection_across_resort() {
        let mut app = AppState::new(false, String::new());
        app.apply_message(snapshot(vec![record("a", 0, 10), record("b", 0, 20)]));
        app.select_sort_column(SortColumn::Download);
        assert_eq!(app.rows[0].id, "b");

        app.select_next();
        assert_eq!(app.get_selected_connection().map(|r| r.id.as_str()), Some("b"));

        app.apply_message(snapshot(vec![record("a", 0, 50), record("b", 0, 20)]));
        assert_eq!(app.rows[0].id, "a");
        assert_eq!(app.get_selected_connection().map(|r| r.id.as_str()), Some("b"));
    }

    #[test]
    fn test_selection_clamped_when_connection_leaves() {
        let mut app = AppState::new(false, String::new());
        app.apply_message(snapshot(vec![record("a", 0, 0), record("b", 0, 0)]));
        app.select_previous();
        app.select_previous();
        assert_eq!(app.selected_index, Some(1));
        let selected = app.rows[1].id.clone();
        let remaining = if selected == "a" { "b" } else { "a" };

        app.apply_message(snapshot(vec![record(remaining, 0, 0)]));

        assert_eq!(app.selected_index, Some(0));
        assert_eq!(app.table_state.selected(), Some(0));
    }

    #[test]
    fn test_device_filter_cycles() {
        let mut app = AppState::new(false, String::new());
        app.apply_message(snapshot(vec![
            from_device("a", "10.0.0.2", 1),
            from_device("b", "10.0.0.1", 1),
            from_device("c", "10.0.0.2", 1),
        ]));
        assert_eq!(app.devices.len(), 2);

        app.cycle_device_filter();
        assert_eq!(app.device_filter.as_deref(), Some("10.0.0.1"));
        assert_eq!(app.rows.len(), 1);

        app.cycle_device_filter();
        assert_eq!(app.device_filter.as_deref(), Some("10.0.0.2"));
        assert_eq!(app.rows.len(), 2);

        app.cycle_device_filter();
        assert_eq!(app.device_filter, None);
        assert_eq!(app.rows.len(), 3);
    }

    #[test]
    fn test_device_filter_cleared_when_device_disappears() {
        let mut app = AppState::new(false, String::new());
        app.apply_message(snapshot(vec![
            from_device("a", "10.0.0.1", 1),
            from_device("b", "10.0.0.2", 1),
        ]));
        app.cycle_device_filter();
        assert_eq!(app.device_filter.as_deref(), Some("10.0.0.1"));

        app.apply_message(snapshot(vec![from_device("b", "10.0.0.2", 1)]));

        assert_eq!(app.device_filter, None);
        assert_eq!(app.rows.len(), 1);
    }

    #[test]
    fn test_fit_truncates_wide_text() {
        assert_eq!(fit("short", 10), "short");
        assert_eq!(fit("exactly10!", 10), "exactly10!");
        assert_eq!(fit("much longer text", 10), "much long…");
    }

    #[test]
    fn test_draw_renders_table() {
        let mut app = AppState::new(true, "127.0.0.1:9090".to_string());
        let mut rec = record("a", 2048, 0);
        rec.rule = "RuleSet".to_string();
        rec.rule_payload = "ads".to_string();
        app.apply_message(snapshot(vec![rec]));
        app.show_close_all_dialog = true;

        let mut terminal = Terminal::new(TestBackend::new(200, 30)).unwrap();
        terminal.draw(|f| draw_ui(f, &mut app)).unwrap();

        let buffer = terminal.backend().buffer();
        let text: String = buffer.content().iter().map(|c| c.symbol()).collect();
        assert!(text.contains("a.example.com:443"));
        assert!(text.contains("RuleSet(ads)"));
        assert!(text.contains("2.00 KB"));
        assert!(text.contains("Close all active connections?"));
    }
}
