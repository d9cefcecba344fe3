use alloy::primitives::U256;
use chrono::Local;
use color_eyre::eyre::Result;
use crossterm::{
    event::{
        self,
        Event,
        KeyCode,
        KeyEventKind,
    },
    terminal::{
        disable_raw_mode,
        enable_raw_mode,
    },
};
use deployments::DeploymentEnv;
use lottery_client::{
    AppView,
    ConnectionState,
    display::{
        NATIVE_SYMBOL,
        format_units,
        short_address,
        whole_units,
    },
    session::NO_WALLET_MESSAGE,
};
use ratatui::{
    prelude::*,
    widgets::*,
};
use std::{
    io::{
        self,
        Stdout,
        stdout,
    },
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    thread,
    time::Duration,
};
use tokio::sync::mpsc;

/// Pool size that fills the gauge. The pool itself is uncapped.
const POOL_BASELINE_UNITS: u64 = 1000;
const INPUT_POLL: Duration = Duration::from_millis(100);

pub enum UserEvent {
    Quit,
    Redraw,
    Connect,
    Disconnect,
    Buy,
    /// Same purchase as `Buy`, offered next to the lucky phrase.
    Lucky,
    SwitchWallet,
    Refresh,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
enum Mode {
    #[default]
    Normal,
    QuitModal,
}

pub struct UiState {
    mode: Mode,
    network: DeploymentEnv,
    lucky_phrase: String,
    terminal: Option<Terminal<CrosstermBackend<Stdout>>>,
}

impl UiState {
    pub fn new(network: DeploymentEnv, lucky_phrase: impl Into<String>) -> Self {
        Self {
            mode: Mode::Normal,
            network,
            lucky_phrase: lucky_phrase.into(),
            terminal: None,
        }
    }
}

pub fn terminal_enter(state: &mut UiState) -> Result<()> {
    enable_raw_mode()?;
    crossterm::execute!(
        stdout(),
        crossterm::terminal::EnterAlternateScreen,
        crossterm::event::EnableMouseCapture
    )?;
    let mut terminal = Terminal::new(CrosstermBackend::new(stdout()))?;
    // Re-entering after a password prompt must repaint everything.
    terminal.clear()?;
    state.terminal = Some(terminal);
    Ok(())
}

pub fn terminal_exit() -> Result<()> {
    disable_raw_mode()?;
    crossterm::execute!(
        stdout(),
        crossterm::event::DisableMouseCapture,
        crossterm::terminal::LeaveAlternateScreen
    )?;
    Ok(())
}

/// Terminal events read on a dedicated thread.
///
/// The reader can be paused while something else owns the terminal, such as
/// the keystore password prompt.
pub struct InputEvents {
    rx: mpsc::UnboundedReceiver<io::Result<Event>>,
    paused: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
}

impl InputEvents {
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let paused = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));
        let reader_paused = Arc::clone(&paused);
        let reader_stopped = Arc::clone(&stopped);
        thread::spawn(move || {
            while !reader_stopped.load(Ordering::SeqCst) {
                if reader_paused.load(Ordering::SeqCst) {
                    thread::sleep(INPUT_POLL);
                    continue;
                }
                let next = match event::poll(INPUT_POLL) {
                    Ok(true) => event::read(),
                    Ok(false) => continue,
                    Err(err) => Err(err),
                };
                let failed = next.is_err();
                if tx.send(next).is_err() || failed {
                    break;
                }
            }
        });
        Self {
            rx,
            paused,
            stopped,
        }
    }

    pub async fn recv(&mut self) -> Option<io::Result<Event>> {
        self.rx.recv().await
    }

    /// Stop reading until `resume`. Returns once any in-progress poll has
    /// timed out.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        thread::sleep(INPUT_POLL * 2);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
}

impl Drop for InputEvents {
    fn drop(&mut self) {
        self.stopped.store(true, Ordering::SeqCst);
    }
}

pub fn interpret_event(state: &mut UiState, event: Event) -> Option<UserEvent> {
    let key = match event {
        Event::Key(key) if key.kind == KeyEventKind::Press => key,
        Event::Resize(_, _) => return Some(UserEvent::Redraw),
        _ => return None,
    };
    match state.mode {
        Mode::QuitModal => match key.code {
            KeyCode::Char('y') | KeyCode::Char('Y') => Some(UserEvent::Quit),
            KeyCode::Char('n') | KeyCode::Char('N') | KeyCode::Esc => {
                state.mode = Mode::Normal;
                Some(UserEvent::Redraw)
            }
            _ => None,
        },
        Mode::Normal => match key.code {
            KeyCode::Char('q') | KeyCode::Esc => {
                state.mode = Mode::QuitModal;
                Some(UserEvent::Redraw)
            }
            KeyCode::Char('c') => Some(UserEvent::Connect),
            KeyCode::Char('d') => Some(UserEvent::Disconnect),
            KeyCode::Char('b') => Some(UserEvent::Buy),
            KeyCode::Char('l') => Some(UserEvent::Lucky),
            KeyCode::Char('w') => Some(UserEvent::SwitchWallet),
            KeyCode::Char('r') => Some(UserEvent::Refresh),
            _ => None,
        },
    }
}

pub fn draw(state: &mut UiState, view: &AppView) -> Result<()> {
    let UiState {
        mode,
        network,
        lucky_phrase,
        terminal,
    } = state;
    if let Some(terminal) = terminal.as_mut() {
        terminal.draw(|f| ui(f, *mode, *network, lucky_phrase, view))?;
    }
    Ok(())
}

fn ui(f: &mut Frame, mode: Mode, network: DeploymentEnv, lucky_phrase: &str, view: &AppView) {
    f.render_widget(Clear, f.area());
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Length(4), // header
            Constraint::Length(3), // wallet + pool
            Constraint::Length(3), // stats
            Constraint::Min(6),    // feed
            Constraint::Length(5), // status
            Constraint::Length(3), // help
        ])
        .split(f.area());

    draw_header(f, chunks[0], network, lucky_phrase, view);
    let top = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(50), Constraint::Percentage(50)])
        .split(chunks[1]);
    draw_wallet_panel(f, top[0], view);
    draw_pool_gauge(f, top[1], view);
    draw_stats(f, chunks[2], view);
    draw_feed(f, chunks[3], view);
    draw_status(f, chunks[4], view);
    draw_help(f, chunks[5]);

    if mode == Mode::QuitModal {
        let area = centered_rect(40, 20, f.area());
        let block = Block::default().borders(Borders::ALL).title("Confirm Quit");
        let p = Paragraph::new("Quit the lottery? (Y/N)");
        f.render_widget(Clear, area);
        f.render_widget(block.clone(), area);
        f.render_widget(p, block.inner(area));
    }
}

fn draw_header(
    f: &mut Frame,
    area: Rect,
    network: DeploymentEnv,
    lucky_phrase: &str,
    view: &AppView,
) {
    let lines = vec![
        Line::from(format!(
            "Network: {network} | Contract: {}",
            short_address(&view.contract)
        )),
        Line::from(Span::styled(
            lucky_phrase.to_string(),
            Style::default().fg(Color::Magenta),
        )),
    ];
    let widget =
        Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Lottery"));
    f.render_widget(widget, area);
}

fn connection_label(view: &AppView) -> String {
    match &view.connection {
        ConnectionState::Connected => match view.account {
            Some(account) => format!("Connected: {}", short_address(&account)),
            None => "Connected".to_string(),
        },
        ConnectionState::Connecting => "Connecting...".to_string(),
        ConnectionState::Disconnected if !view.wallet_available => {
            format!("{NO_WALLET_MESSAGE} (read-only)")
        }
        ConnectionState::Disconnected => "Not connected".to_string(),
        ConnectionState::Error(message) => format!("Disconnected: {message}"),
    }
}

fn draw_wallet_panel(f: &mut Frame, area: Rect, view: &AppView) {
    let widget = Paragraph::new(connection_label(view))
        .block(Block::default().borders(Borders::ALL).title("Wallet"));
    f.render_widget(widget, area);
}

fn pool_progress(pool_balance: U256) -> f64 {
    let units = whole_units(pool_balance) as f64;
    (units / POOL_BASELINE_UNITS as f64).clamp(0.0, 1.0)
}

fn draw_pool_gauge(f: &mut Frame, area: Rect, view: &AppView) {
    let (ratio, label) = match &view.snapshot {
        Some(snapshot) => (
            pool_progress(snapshot.pool_balance),
            format!("{} {NATIVE_SYMBOL}", format_units(snapshot.pool_balance, 4)),
        ),
        None => (0.0, "loading...".to_string()),
    };
    let gauge = Gauge::default()
        .block(Block::default().borders(Borders::ALL).title("Prize Pool"))
        .gauge_style(Style::default().fg(Color::Yellow))
        .ratio(ratio)
        .label(label);
    f.render_widget(gauge, area);
}

fn price_label(price: Option<U256>) -> String {
    match price {
        Some(price) => format!("{} {NATIVE_SYMBOL}", format_units(price, 2)),
        None => "N/A".to_string(),
    }
}

fn stats_line(view: &AppView) -> String {
    let Some(snapshot) = &view.snapshot else {
        return "Waiting for first sync...".to_string();
    };
    let yours = match view.caller_ticket_count {
        Some(count) => count.to_string(),
        None => "-".to_string(),
    };
    format!(
        "Round: {} | Tickets sold: {} | Your tickets: {} | Ticket price: {}",
        snapshot.round,
        snapshot.ticket_count,
        yours,
        price_label(snapshot.ticket_price)
    )
}

fn draw_stats(f: &mut Frame, area: Rect, view: &AppView) {
    let widget = Paragraph::new(stats_line(view))
        .block(Block::default().borders(Borders::ALL).title("Round"));
    f.render_widget(widget, area);
}

fn draw_feed(f: &mut Frame, area: Rect, view: &AppView) {
    let items: Vec<ListItem> = if view.feed.is_empty() {
        vec![ListItem::new("No purchases yet")]
    } else {
        view.feed
            .iter()
            .map(|entry| {
                let at = entry.observed_at.with_timezone(&Local).format("%H:%M:%S");
                ListItem::new(format!("{at}  {}", entry.display_text))
            })
            .collect()
    };
    let list = List::new(items).block(Block::default().borders(Borders::ALL).title("Live Purchases"));
    f.render_widget(list, area);
}

fn status_lines(view: &AppView) -> Vec<Line<'static>> {
    let mut lines = Vec::new();
    if let Some(tx) = view.purchase_pending {
        lines.push(Line::from(Span::styled(
            format!("Pending transaction {tx}"),
            Style::default().fg(Color::Cyan),
        )));
    }
    let status_style = if view.status.starts_with("Purchase failed")
        || view.status.starts_with("Connection failed")
    {
        Style::default().fg(Color::Red)
    } else {
        Style::default().fg(Color::Green)
    };
    let status = if view.status.trim().is_empty() {
        "Ready".to_string()
    } else {
        view.status.clone()
    };
    lines.push(Line::from(Span::styled(status, status_style)));
    for notice in [&view.read_error, &view.feed_notice].into_iter().flatten() {
        lines.push(Line::from(Span::styled(
            notice.clone(),
            Style::default().fg(Color::Yellow),
        )));
    }
    lines
}

fn draw_status(f: &mut Frame, area: Rect, view: &AppView) {
    let widget = Paragraph::new(status_lines(view))
        .wrap(Wrap { trim: false })
        .block(Block::default().borders(Borders::ALL).title("Status"));
    f.render_widget(widget, area);
}

fn draw_help(f: &mut Frame, area: Rect) {
    let help = Paragraph::new(
        "c connect | d disconnect | b buy ticket | l feeling lucky | w switch wallet | r refresh | q/Esc quit",
    )
    .block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(help, area);
}

fn centered_rect(w_percent: u16, h_percent: u16, r: Rect) -> Rect {
    let popup_layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([
            Constraint::Percentage((100 - h_percent) / 2),
            Constraint::Percentage(h_percent),
            Constraint::Percentage((100 - h_percent) / 2),
        ])
        .split(r);

    Layout::default()
        .direction(Direction::Horizontal)
        .constraints([
            Constraint::Percentage((100 - w_percent) / 2),
            Constraint::Percentage(w_percent),
            Constraint::Percentage((100 - w_percent) / 2),
        ])
        .split(popup_layout[1])[1]
}
