//! Priorities (active orders in worklist order)
//! Allocations (active allocations per order and worker)
//! Workers (capacity and load per worker)

use std::{
  error::Error,
  io,
  sync::mpsc,
  thread,
  time::{Duration, Instant},
};

use crossterm::{
  event::{self, DisableMouseCapture, EnableMouseCapture, Event as CEvent, KeyCode},
  execute,
  terminal::{disable_raw_mode, enable_raw_mode, EnterAlternateScreen, LeaveAlternateScreen},
};
use tui::{
  backend::{Backend, CrosstermBackend},
  layout::{Constraint, Direction, Layout, Rect},
  style::{Color, Modifier, Style},
  text::{Span, Spans},
  widgets::{Block, Borders, List, ListItem, Paragraph, Tabs},
  Terminal,
};
use chrono::NaiveDate;
use lapin::Channel;
use sqlx::{Pool, Postgres, Row};
use tokio::runtime::Runtime;
use shopfloor::{config::Config, database::setup_database, messaging::{create_rabbit_channel, feed_backlog}};

struct OrderInfo {
  code: String,
  priority: i16,
  due_date: NaiveDate,
  remaining_hours: f64,
  allocated_hours: f64,
  completion: f64,
}

struct AllocationInfo {
  order_code: String,
  worker_id: i32,
  hours: f64,
  worked_hours: f64,
  state: String,
  progress: f64,
}

struct WorkerInfo {
  id: i32,
  name: String,
  capacity_hours: f64,
  committed_hours: f64,
  available_hours: f64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
enum DashboardTab {
  Priorities,
  Allocations,
  Workers,
}

struct App {
  current_tab: DashboardTab,
  orders: Vec<OrderInfo>,
  allocations: Vec<AllocationInfo>,
  workers: Vec<WorkerInfo>,
  last_run: Option<(i64, String)>,
  backlog: Option<u32>,
  status: Option<String>,
}

impl App {
  fn new() -> Self {
    Self {
      current_tab: DashboardTab::Priorities,
      orders: vec![],
      allocations: vec![],
      workers: vec![],
      last_run: None,
      backlog: None,
      status: None,
    }
  }

  fn next_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Priorities => DashboardTab::Allocations,
      DashboardTab::Allocations => DashboardTab::Workers,
      DashboardTab::Workers => DashboardTab::Priorities,
    }
  }

  fn previous_tab(&mut self) {
    self.current_tab = match self.current_tab {
      DashboardTab::Priorities => DashboardTab::Workers,
      DashboardTab::Allocations => DashboardTab::Priorities,
      DashboardTab::Workers => DashboardTab::Allocations,
    }
  }
}

async fn fetch_db_state(pool: &Pool<Postgres>) -> Result<App, sqlx::Error> {
  let mut app = App::new();

  let order_rows = sqlx::query(
    r#"
    SELECT code, priority, due_date, remaining_hours, allocated_hours, completion
    FROM orders
    ORDER BY rank
    "#,
  )
    .fetch_all(pool)
    .await?;
  app.orders = order_rows
    .into_iter()
    .map(|row| -> Result<OrderInfo, sqlx::Error> {
      Ok(OrderInfo {
        code: row.try_get("code")?,
        priority: row.try_get("priority")?,
        due_date: row.try_get("due_date")?,
        remaining_hours: row.try_get("remaining_hours")?,
        allocated_hours: row.try_get("allocated_hours")?,
        completion: row.try_get("completion")?,
      })
    })
    .collect::<Result<_, _>>()?;

  let allocation_rows = sqlx::query(
    r#"
    SELECT order_code, worker_id, hours, worked_hours, state, progress
    FROM allocations
    ORDER BY order_code, worker_id
    "#,
  )
    .fetch_all(pool)
    .await?;
  app.allocations = allocation_rows
    .into_iter()
    .map(|row| -> Result<AllocationInfo, sqlx::Error> {
      Ok(AllocationInfo {
        order_code: row.try_get("order_code")?,
        worker_id: row.try_get("worker_id")?,
        hours: row.try_get("hours")?,
        worked_hours: row.try_get("worked_hours")?,
        state: row.try_get("state")?,
        progress: row.try_get("progress")?,
      })
    })
    .collect::<Result<_, _>>()?;

  let worker_rows = sqlx::query(
    r#"
    SELECT id, name, capacity_hours, committed_hours, available_hours
    FROM workers
    ORDER BY id
    "#,
  )
    .fetch_all(pool)
    .await?;
  app.workers = worker_rows
    .into_iter()
    .map(|row| -> Result<WorkerInfo, sqlx::Error> {
      Ok(WorkerInfo {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        capacity_hours: row.try_get("capacity_hours")?,
        committed_hours: row.try_get("committed_hours")?,
        available_hours: row.try_get("available_hours")?,
      })
    })
    .collect::<Result<_, _>>()?;

  let last_run = sqlx::query(
    r#"
    SELECT cycle, to_char(settled_at, 'YYYY-MM-DD HH24:MI:SS') AS settled_at
    FROM schedule_runs
    ORDER BY settled_at DESC
    LIMIT 1
    "#,
  )
    .fetch_optional(pool)
    .await?;
  if let Some(row) = last_run {
    let settled_at: Option<String> = row.try_get("settled_at")?;
    app.last_run = Some((row.try_get("cycle")?, settled_at.unwrap_or_else(|| "N/A".into())));
  }

  Ok(app)
}

fn spawn_fetcher(config: Config, tx: mpsc::Sender<App>) -> Result<(), Box<dyn Error>> {
  let database_url = config.database_url.clone().ok_or("DATABASE_URL must be set")?;
  thread::spawn(move || {
    let rt = match Runtime::new() {
      Ok(rt) => rt,
      Err(e) => {
        let mut app = App::new();
        app.status = Some(format!("runtime error: {}", e));
        let _ = tx.send(app);
        return;
      }
    };
    let pool = rt.block_on(setup_database(&database_url));
    let channel: Option<Channel> = config
      .rabbitmq_url
      .as_deref()
      .and_then(|url| rt.block_on(create_rabbit_channel(url)).ok());
    loop {
      let mut app = match &pool {
        Ok(pool) => rt.block_on(fetch_db_state(pool)).unwrap_or_else(|e| {
          let mut app = App::new();
          app.status = Some(format!("database error: {}", e));
          app
        }),
        Err(e) => {
          let mut app = App::new();
          app.status = Some(format!("database unavailable: {}", e));
          app
        }
      };
      if let Some(channel) = &channel {
        app.backlog = rt.block_on(feed_backlog(channel)).ok();
      }
      if tx.send(app).is_err() {
        return;
      }
      thread::sleep(Duration::from_secs(2));
    }
  });
  Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
  let config = Config::from_env()?;
  let (tx, rx) = mpsc::channel::<App>();
  spawn_fetcher(config, tx)?;

  enable_raw_mode()?;
  let mut stdout = io::stdout();
  execute!(stdout, EnterAlternateScreen, EnableMouseCapture)?;
  let backend = CrosstermBackend::new(stdout);
  let mut terminal = Terminal::new(backend)?;

  let mut app = App::new();
  let tick_rate = Duration::from_millis(500);
  let mut last_tick = Instant::now();

  loop {
    if let Ok(mut new_state) = rx.try_recv() {
      new_state.current_tab = app.current_tab;
      app = new_state;
    }
    terminal.draw(|f| ui(f, &app))?;

    let timeout = tick_rate
      .checked_sub(last_tick.elapsed())
      .unwrap_or_else(|| Duration::from_secs(0));
    if event::poll(timeout)? {
      if let CEvent::Key(key) = event::read()? {
        match key.code {
          KeyCode::Char('q') => break,
          KeyCode::Right => app.next_tab(),
          KeyCode::Left => app.previous_tab(),
          _ => {}
        }
      }
    }
    if last_tick.elapsed() >= tick_rate {
      last_tick = Instant::now();
    }
  }

  disable_raw_mode()?;
  execute!(terminal.backend_mut(), LeaveAlternateScreen, DisableMouseCapture)?;
  terminal.show_cursor()?;
  Ok(())
}

fn ui<B: Backend>(f: &mut tui::Frame<B>, app: &App) {
  let chunks = Layout::default()
    .direction(Direction::Vertical)
    .margin(1)
    .constraints([
      Constraint::Length(3),
      Constraint::Min(0),
      Constraint::Length(3),
    ].as_ref())
    .split(f.size());

  let tab_titles = vec!["Priorities", "Allocations", "Workers"];
  let tabs = Tabs::new(
    tab_titles
      .iter()
      .map(|t| Spans::from(Span::styled(*t, Style::default().fg(Color::Yellow))))
      .collect(),
  )
    .block(Block::default().borders(Borders::ALL).title(title(app)))
    .highlight_style(Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD))
    .select(match app.current_tab {
      DashboardTab::Priorities => 0,
      DashboardTab::Allocations => 1,
      DashboardTab::Workers => 2,
    });
  f.render_widget(tabs, chunks[0]);

  match app.current_tab {
    DashboardTab::Priorities => render_priorities(f, app, chunks[1]),
    DashboardTab::Allocations => render_allocations(f, app, chunks[1]),
    DashboardTab::Workers => render_workers(f, app, chunks[1]),
  }

  let footer_text = match &app.status {
    Some(status) => format!("←/→: Switch Tabs | q: Quit | {}", status),
    None => "←/→: Switch Tabs | q: Quit".to_string(),
  };
  let footer = Paragraph::new(footer_text)
    .style(Style::default().fg(Color::White))
    .block(Block::default().borders(Borders::ALL));
  f.render_widget(footer, chunks[2]);
}

fn title(app: &App) -> String {
  let run = match &app.last_run {
    Some((cycle, at)) => format!("cycle {} settled {}", cycle, at),
    None => "no settled cycle yet".to_string(),
  };
  match app.backlog {
    Some(backlog) => format!("Schedule ({}, feed backlog: {})", run, backlog),
    None => format!("Schedule ({})", run),
  }
}

fn priority_color(priority: i16) -> Color {
  match priority {
    5 | 4 => Color::Red,
    3 | 2 => Color::Yellow,
    _ => Color::Green,
  }
}

fn load_bar(fraction: f64, width: usize) -> String {
  let filled = ((fraction.clamp(0.0, 1.0) * width as f64).round() as usize).min(width);
  format!("[{}{}]", "#".repeat(filled), "-".repeat(width - filled))
}

fn render_priorities<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app.orders.iter().map(|o| {
    ListItem::new(Spans::from(vec![
      Span::styled(
        format!("P{} ", o.priority),
        Style::default().fg(priority_color(o.priority)).add_modifier(Modifier::BOLD),
      ),
      Span::styled(format!("{:<16} ", o.code), Style::default().add_modifier(Modifier::BOLD)),
      Span::raw(format!(
        "due {} | {:.1} h left | {:.1} h allocated | {:.0}% done",
        o.due_date, o.remaining_hours, o.allocated_hours, o.completion
      )),
    ]))
  }).collect();
  let list = List::new(if items.is_empty() { vec![ListItem::new(Spans::from(Span::raw("No active orders")))] } else { items })
    .block(Block::default().borders(Borders::ALL).title(format!("Active Orders ({})", app.orders.len())));
  f.render_widget(list, area);
}

fn render_allocations<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let items: Vec<ListItem> = app.allocations.iter().map(|a| {
    ListItem::new(Spans::from(vec![
      Span::styled(format!("{:<16} ", a.order_code), Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)),
      Span::raw(format!(
        "worker {} | {:.1}/{:.1} h | {} {}",
        a.worker_id, a.worked_hours, a.hours, a.state, load_bar(a.progress, 10)
      )),
    ]))
  }).collect();
  let list = List::new(items)
    .block(Block::default().borders(Borders::ALL).title("Active Allocations"));
  f.render_widget(list, area);
}

fn render_workers<B: Backend>(f: &mut tui::Frame<B>, app: &App, area: Rect) {
  let chunks = Layout::default()
    .direction(Direction::Horizontal)
    .constraints([Constraint::Percentage(50), Constraint::Percentage(50)].as_ref())
    .split(area);

  let worker_items: Vec<ListItem> = app.workers.iter().map(|w| {
    let load = if w.capacity_hours > 0.0 { w.committed_hours / w.capacity_hours } else { 0.0 };
    let lines = vec![
      Spans::from(Span::styled(format!("{} ({})", w.name, w.id), Style::default().add_modifier(Modifier::BOLD))),
      Spans::from(Span::raw(format!("Load: {} {:.0}%", load_bar(load, 20), load * 100.0))),
      Spans::from(Span::raw(format!("Committed {:.1} h | Available {:.1} h", w.committed_hours, w.available_hours))),
    ];
    ListItem::new(lines)
  }).collect();
  let workers_list = List::new(worker_items)
    .block(Block::default().borders(Borders::ALL).title("Workers"));
  f.render_widget(workers_list, chunks[0]);

  let assigned: Vec<ListItem> = app.workers.iter().map(|w| {
    let orders: Vec<&str> = app.allocations
      .iter()
      .filter(|a| a.worker_id == w.id)
      .map(|a| a.order_code.as_str())
      .collect();
    let text = if orders.is_empty() { "idle".to_string() } else { orders.join(", ") };
    ListItem::new(Spans::from(Span::raw(format!("{}: {}", w.name, text))))
  }).collect();
  let assigned_list = List::new(assigned)
    .block(Block::default().borders(Borders::ALL).title("Assigned Orders"));
  f.render_widget(assigned_list, chunks[1]);
}
