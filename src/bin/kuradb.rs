use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use kuradb::{Connection, Database, KuraError, QueryResult, StmtId, Value};

#[derive(Parser)]
#[command(name = "kuradb", version, about = "KuraDB - embeddable SQL database")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive SQL shell
    Shell {
        /// Database file (omit for in-memory)
        db: Option<PathBuf>,
        /// Open with a password-derived key (prompts when no value given)
        #[arg(long)]
        password: Option<Option<String>>,
    },
    /// Execute one statement and exit
    Exec {
        db: PathBuf,
        sql: String,
        #[arg(long)]
        password: Option<Option<String>>,
    },
    /// Print the version
    Version,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let code = match cli.command {
        Command::Shell { db, password } => run_shell(db, password),
        Command::Exec { db, sql, password } => run_exec(&db, &sql, password),
        Command::Version => {
            println!("kuradb {}", env!("CARGO_PKG_VERSION"));
            0
        }
    };
    process::exit(code);
}

fn read_password(arg: Option<Option<String>>) -> Option<String> {
    match arg {
        None => None,
        Some(Some(pw)) => Some(pw),
        Some(None) => match rpassword::read_password_from_tty(Some("Password: ")) {
            Ok(pw) => Some(pw),
            Err(e) => {
                eprintln!("ERROR: failed to read password: {}", e);
                process::exit(1);
            }
        },
    }
}

fn open_connection(path: Option<&PathBuf>, password: Option<String>) -> Result<Connection, KuraError> {
    match (path, password) {
        (None, _) => kuradb::open_memory(),
        (Some(p), None) => kuradb::open(p),
        (Some(p), Some(pw)) => {
            let db = if p.exists() {
                Database::open_with_password(p, &pw)?
            } else {
                Database::create_with_password(p, &pw)?
            };
            Ok(db.connect())
        }
    }
}

fn run_exec(db: &PathBuf, sql: &str, password: Option<Option<String>>) -> i32 {
    let pw = read_password(password);
    let mut conn = match open_connection(Some(db), pw) {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return 1;
        }
    };
    match conn.execute(sql) {
        Ok(result) => {
            println!("{}", format_result(&result));
            0
        }
        Err(e) => {
            eprintln!("ERROR: {}", e);
            1
        }
    }
}

struct Shell {
    conn: Option<Connection>,
    stmt: Option<StmtId>,
    had_error: bool,
}

fn run_shell(db: Option<PathBuf>, password: Option<Option<String>>) -> i32 {
    let pw = read_password(password);
    let conn = match open_connection(db.as_ref(), pw) {
        Ok(conn) => conn,
        Err(e) => {
            eprintln!("ERROR: {}", e);
            return 1;
        }
    };
    match db {
        Some(p) => println!("Connected to {}", p.display()),
        None => println!("Connected to a transient in-memory database."),
    }
    println!("Enter SQL, or .help for meta commands.");

    let mut shell = Shell {
        conn: Some(conn),
        stmt: None,
        had_error: false,
    };
    let mut editor = match DefaultEditor::new() {
        Ok(e) => e,
        Err(e) => {
            eprintln!("ERROR: cannot start line editor: {}", e);
            return 1;
        }
    };

    loop {
        match editor.readline("kuradb> ") {
            Ok(line) => {
                let line = line.trim().to_string();
                if line.is_empty() {
                    continue;
                }
                let _ = editor.add_history_entry(&line);
                if line.starts_with('.') {
                    if !shell.run_meta(&line) {
                        break;
                    }
                } else {
                    shell.run_sql(&line);
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("ERROR: {}", e);
                shell.had_error = true;
                break;
            }
        }
    }
    i32::from(shell.had_error)
}

impl Shell {
    fn conn_mut(&mut self) -> Option<&mut Connection> {
        if self.conn.is_none() {
            eprintln!("ERROR: no database open (use .open or .memory)");
            self.had_error = true;
        }
        self.conn.as_mut()
    }

    fn run_sql(&mut self, sql: &str) {
        let Some(conn) = self.conn_mut() else {
            return;
        };
        match conn.execute(sql) {
            Ok(result) => println!("{}", format_result(&result)),
            Err(e) => {
                eprintln!("ERROR: {}", e);
                self.had_error = true;
            }
        }
    }

    fn report(&mut self, result: Result<(), KuraError>) {
        if let Err(e) = result {
            eprintln!("ERROR: {}", e);
            self.had_error = true;
        }
    }

    /// Returns false to quit the REPL.
    fn run_meta(&mut self, line: &str) -> bool {
        let mut parts = line.splitn(2, char::is_whitespace);
        let cmd = parts.next().unwrap_or_default();
        let rest = parts.next().unwrap_or("").trim().to_string();

        match cmd {
            ".quit" | ".exit" => return false,
            ".help" => {
                println!(".open <path>     open a database file");
                println!(".memory          switch to an in-memory database");
                println!(".close           close the current database");
                println!(".tables          list tables");
                println!(".schema [table]  show CREATE statements");
                println!(".stats           engine statistics");
                println!(".prepare <sql>   prepare a statement");
                println!(".bind <i> <v>    bind parameter slot i");
                println!(".execute         run the prepared statement");
                println!(".quit            leave the shell");
            }
            ".open" => {
                if rest.is_empty() {
                    eprintln!("ERROR: usage: .open <path>");
                    self.had_error = true;
                    return true;
                }
                match kuradb::open(&PathBuf::from(&rest)) {
                    Ok(conn) => {
                        self.conn = Some(conn);
                        self.stmt = None;
                        println!("Connected to {}", rest);
                    }
                    Err(e) => {
                        eprintln!("ERROR: {}", e);
                        self.had_error = true;
                    }
                }
            }
            ".memory" => match kuradb::open_memory() {
                Ok(conn) => {
                    self.conn = Some(conn);
                    self.stmt = None;
                    println!("Connected to a transient in-memory database.");
                }
                Err(e) => {
                    eprintln!("ERROR: {}", e);
                    self.had_error = true;
                }
            },
            ".close" => {
                self.conn = None;
                self.stmt = None;
            }
            ".tables" => {
                if let Some(conn) = self.conn_mut() {
                    match conn.list_tables() {
                        Ok(names) => {
                            let rows = names.into_iter().map(|n| vec![Value::Text(n)]).collect();
                            println!(
                                "{}",
                                format_result(&QueryResult {
                                    columns: vec!["table".into()],
                                    rows,
                                    affected_rows: 0,
                                })
                            );
                        }
                        Err(e) => {
                            eprintln!("ERROR: {}", e);
                            self.had_error = true;
                        }
                    }
                }
            }
            ".schema" => {
                if let Some(conn) = self.conn_mut() {
                    let filter = if rest.is_empty() { None } else { Some(rest.as_str()) };
                    match conn.schema_sql(filter) {
                        Ok(stmts) => {
                            for stmt in stmts {
                                println!("{};", stmt);
                            }
                        }
                        Err(e) => {
                            eprintln!("ERROR: {}", e);
                            self.had_error = true;
                        }
                    }
                }
            }
            ".stats" => {
                if let Some(conn) = self.conn_mut() {
                    match conn.stats() {
                        Ok(stats) => {
                            let rows = vec![
                                stat_row("table_count", stats.table_count.to_string()),
                                stat_row("index_count", stats.index_count.to_string()),
                                stat_row("page_count", stats.page_count.to_string()),
                                stat_row("cached_pages", stats.cached_pages.to_string()),
                                stat_row(
                                    "cache_hit_ratio",
                                    format!("{:.3}", stats.cache_hit_ratio),
                                ),
                            ];
                            println!(
                                "{}",
                                format_result(&QueryResult {
                                    columns: vec!["stat".into(), "value".into()],
                                    rows,
                                    affected_rows: 0,
                                })
                            );
                        }
                        Err(e) => {
                            eprintln!("ERROR: {}", e);
                            self.had_error = true;
                        }
                    }
                }
            }
            ".prepare" => {
                if rest.is_empty() {
                    eprintln!("ERROR: usage: .prepare <sql>");
                    self.had_error = true;
                    return true;
                }
                if let Some(conn) = self.conn_mut() {
                    match conn.prepare(&rest) {
                        Ok(id) => {
                            self.stmt = Some(id);
                            println!("Prepared.");
                        }
                        Err(e) => {
                            eprintln!("ERROR: {}", e);
                            self.had_error = true;
                        }
                    }
                }
            }
            ".bind" => {
                let Some(stmt) = self.stmt else {
                    eprintln!("ERROR: no prepared statement (use .prepare)");
                    self.had_error = true;
                    return true;
                };
                let mut args = rest.splitn(2, char::is_whitespace);
                let (Some(idx), Some(raw)) = (args.next(), args.next()) else {
                    eprintln!("ERROR: usage: .bind <index> <value>");
                    self.had_error = true;
                    return true;
                };
                let Ok(idx) = idx.parse::<usize>() else {
                    eprintln!("ERROR: bind index must be a number");
                    self.had_error = true;
                    return true;
                };
                let value = parse_bind_value(raw.trim());
                if let Some(conn) = self.conn_mut() {
                    let result = conn.bind(stmt, idx, value);
                    self.report(result);
                }
            }
            ".execute" => {
                let Some(stmt) = self.stmt else {
                    eprintln!("ERROR: no prepared statement (use .prepare)");
                    self.had_error = true;
                    return true;
                };
                if let Some(conn) = self.conn_mut() {
                    match conn.execute_stmt(stmt) {
                        Ok(result) => println!("{}", format_result(&result)),
                        Err(e) => {
                            eprintln!("ERROR: {}", e);
                            self.had_error = true;
                        }
                    }
                }
            }
            other => {
                eprintln!("ERROR: unknown meta command {} (try .help)", other);
                self.had_error = true;
            }
        }
        true
    }
}

fn stat_row(name: &str, value: String) -> Vec<Value> {
    vec![Value::Text(name.to_string()), Value::Text(value)]
}

/// `.bind` value syntax: integers, reals, NULL, x'hex' blobs, else text.
fn parse_bind_value(raw: &str) -> Value {
    if raw.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(v) = raw.parse::<i64>() {
        return Value::Integer(v);
    }
    if let Ok(v) = raw.parse::<f64>() {
        return Value::Real(v);
    }
    if (raw.starts_with("x'") || raw.starts_with("X'")) && raw.ends_with('\'') {
        let hex = &raw[2..raw.len() - 1];
        if hex.len() % 2 == 0 {
            let mut blob = Vec::with_capacity(hex.len() / 2);
            let mut ok = true;
            for pair in hex.as_bytes().chunks(2) {
                match std::str::from_utf8(pair)
                    .ok()
                    .and_then(|s| u8::from_str_radix(s, 16).ok())
                {
                    Some(b) => blob.push(b),
                    None => {
                        ok = false;
                        break;
                    }
                }
            }
            if ok {
                return Value::Blob(blob);
            }
        }
    }
    // Strip optional quotes around text.
    let text = raw
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(raw);
    Value::Text(text.to_string())
}

fn format_value(value: &Value) -> String {
    match value {
        Value::Blob(b) => {
            let hex: String = b.iter().map(|byte| format!("{:02x}", byte)).collect();
            format!("x'{}'", hex)
        }
        other => other.to_string(),
    }
}

fn format_result(result: &QueryResult) -> String {
    if result.rows.is_empty() {
        return if result.affected_rows > 0 {
            format!("OK, {} row(s) affected", result.affected_rows)
        } else if result.columns.is_empty() {
            "OK".to_string()
        } else {
            "Empty set".to_string()
        };
    }

    let columns: Vec<String> = if result.columns.is_empty() {
        (0..result.rows[0].len()).map(|i| format!("c{}", i)).collect()
    } else {
        result.columns.clone()
    };

    let mut widths: Vec<usize> = columns.iter().map(|c| c.len()).collect();
    for row in &result.rows {
        for (i, value) in row.iter().enumerate() {
            widths[i] = widths[i].max(format_value(value).len());
        }
    }

    let separator: String = widths
        .iter()
        .map(|w| format!("+{}", "-".repeat(w + 2)))
        .collect::<String>()
        + "+";

    let mut out = String::new();
    out.push_str(&separator);
    out.push('\n');
    let header: String = columns
        .iter()
        .zip(&widths)
        .map(|(name, w)| format!("| {:<width$} ", name, width = w))
        .collect::<String>()
        + "|";
    out.push_str(&header);
    out.push('\n');
    out.push_str(&separator);
    out.push('\n');

    for row in &result.rows {
        let line: String = row
            .iter()
            .zip(&widths)
            .map(|(value, w)| format!("| {:<width$} ", format_value(value), width = w))
            .collect::<String>()
            + "|";
        out.push_str(&line);
        out.push('\n');
    }
    out.push_str(&separator);
    out.push('\n');
    out.push_str(&format!("{} row(s) in set", result.rows.len()));
    out
}
