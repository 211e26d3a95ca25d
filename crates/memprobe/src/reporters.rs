//! Bundled [`ProbeReporter`] implementations: console, file and JSON.

use std::fmt::Write as _;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::Mutex;

use colored::Colorize;
use prettytable::{Attr, Cell, Row, Table};
use serde::Serialize;

use crate::probe::ResourceView;
use crate::report::{format_hex_dump, plural, InvalidBlockReport, ProbeReporter, StatsSnapshot};

fn format_event_line(verb: &str, view: &ResourceView<'_>, address: usize, bytes: usize, alignment: usize, index: i64) -> String {
    let r = view.resource();
    let mut line = String::from("test_resource");
    if !r.name().is_empty() {
        let _ = write!(line, " [{}]", r.name());
    }
    let _ = write!(
        line,
        " [{index}]: {verb} {bytes} byte{} (aligned {alignment}) at {address:#x}.",
        plural(bytes)
    );
    line
}

fn format_allocation(view: &ResourceView<'_>) -> String {
    let r = view.resource();
    format_event_line(
        "Allocated",
        view,
        r.last_allocated_address() as usize,
        r.last_allocated_bytes(),
        r.last_allocated_alignment(),
        r.last_allocated_index(),
    )
}

fn format_deallocation(view: &ResourceView<'_>) -> String {
    let r = view.resource();
    format_event_line(
        "Deallocated",
        view,
        r.last_deallocated_address() as usize,
        r.last_deallocated_bytes(),
        r.last_deallocated_alignment(),
        r.last_deallocated_index(),
    )
}

fn format_release(view: &ResourceView<'_>) -> String {
    let r = view.resource();
    let mut text = String::from("MEMORY_LEAK");
    if !r.name().is_empty() {
        let _ = write!(text, " from {}", r.name());
    }
    let _ = write!(
        text,
        ":\n   Number of blocks in use = {}\n   Number of bytes in use = {}",
        r.blocks_in_use(),
        r.bytes_in_use()
    );
    text
}

fn stats_table(view: &ResourceView<'_>) -> Table {
    let r = view.resource();
    let mut table = Table::new();
    table.add_row(Row::new(vec![
        Cell::new("Category").with_style(Attr::Bold),
        Cell::new("Blocks").with_style(Attr::Bold),
        Cell::new("Bytes").with_style(Attr::Bold),
    ]));
    for (category, blocks, bytes) in [
        ("In use", r.blocks_in_use(), r.bytes_in_use()),
        ("Max", r.max_blocks(), r.max_bytes()),
        ("Total", r.total_blocks(), r.total_bytes()),
    ] {
        table.add_row(Row::new(vec![
            Cell::new(category),
            Cell::new(&blocks.to_string()),
            Cell::new(&bytes.to_string()),
        ]));
    }
    table
}

fn format_print(view: &ResourceView<'_>) -> String {
    let r = view.resource();
    let title = if r.name().is_empty() {
        "TEST RESOURCE STATE".to_string()
    } else {
        format!("TEST RESOURCE {} STATE", r.name())
    };
    let mut text = format!(
        "\n======================================================\n  {title}\n------------------------------------------------------\n"
    );
    let _ = write!(text, "{}", stats_table(view));
    let _ = write!(
        text,
        "Mismatches: {}   Bounds errors: {}   Param errors: {}\n",
        r.mismatches(),
        r.bounds_errors(),
        r.bad_deallocate_params()
    );
    if view.has_outstanding() {
        text.push_str(" Indices of outstanding memory allocations:\n ");
        let mut on_line = 0;
        view.visit_outstanding(|index| {
            if on_line == 8 {
                text.push_str("\n ");
                on_line = 0;
            }
            let _ = write!(text, "  {index}");
            on_line += 1;
        });
        text.push('\n');
    }
    text
}

fn format_invalid_block(report: &InvalidBlockReport) -> String {
    let address = report.payload_address;
    let mut text = String::new();
    if !report.magic_is_live() {
        if report.magic_is_freed() {
            let _ = writeln!(
                text,
                "*** Deallocating previously deallocated memory at {address:#x}. ***"
            );
        } else {
            let _ = writeln!(
                text,
                "*** Invalid magic number {:#010x} at address {address:#x}. ***",
                report.magic
            );
        }
    } else if report.wrong_owner {
        let _ = writeln!(
            text,
            "*** Freeing segment at {address:#x} from wrong allocator. ***"
        );
    } else {
        let recorded_bytes = report.recorded_bytes.unwrap_or(0);
        if let Some(recorded) = report.recorded_bytes {
            if report.claimed_bytes != recorded {
                let _ = writeln!(
                    text,
                    "*** Freeing segment at {address:#x} using wrong size ({} vs. {recorded}). ***",
                    report.claimed_bytes
                );
            }
        }
        if let Some(recorded) = report.recorded_alignment {
            if report.claimed_alignment != recorded {
                let _ = writeln!(
                    text,
                    "*** Freeing segment at {address:#x} using wrong alignment ({} vs. {recorded}). ***",
                    report.claimed_alignment
                );
            }
        }
        if report.underrun_by != 0 {
            let _ = writeln!(
                text,
                "*** Memory corrupted at {} byte{} before {recorded_bytes} byte segment at {address:#x}. ***",
                report.underrun_by,
                plural(report.underrun_by)
            );
            let fields = std::mem::size_of::<crate::layout::Header>();
            if let Some(front_pad) = report.header_dump.get(fields..) {
                let _ = writeln!(text, "Pad area before user segment:");
                let _ = write!(
                    text,
                    "{}",
                    format_hex_dump(front_pad, report.header_address + fields)
                );
            }
        }
        if report.overrun_by != 0 {
            let _ = writeln!(
                text,
                "*** Memory corrupted at {} byte{} after {recorded_bytes} byte segment at {address:#x}. ***",
                report.overrun_by,
                plural(report.overrun_by)
            );
            if let Some(trailing) = &report.trailing_dump {
                let _ = writeln!(text, "Pad area after user segment:");
                let _ = write!(
                    text,
                    "{}",
                    format_hex_dump(trailing, address + recorded_bytes)
                );
            }
        }
    }
    let _ = writeln!(text, "Header + padding:");
    let _ = write!(
        text,
        "{}",
        format_hex_dump(&report.header_dump, report.header_address)
    );
    if !report.payload_dump.is_empty() {
        let _ = writeln!(text, "User segment:");
        let _ = write!(text, "{}", format_hex_dump(&report.payload_dump, address));
    }
    text
}

/// Reporter that renders events as plain text on standard output.
///
/// This is the initial process-wide default. Error banners are
/// highlighted unless `NO_COLOR` is set.
#[derive(Debug)]
pub struct ConsoleReporter {
    colors: bool,
}

impl ConsoleReporter {
    pub fn new() -> Self {
        Self {
            colors: std::env::var("NO_COLOR").is_err(),
        }
    }

    fn banner(&self, text: &str) -> String {
        if self.colors {
            text.red().bold().to_string()
        } else {
            text.to_string()
        }
    }
}

impl Default for ConsoleReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProbeReporter for ConsoleReporter {
    fn on_allocation(&self, view: &ResourceView<'_>) {
        println!("{}", format_allocation(view));
    }

    fn on_deallocation(&self, view: &ResourceView<'_>) {
        println!("{}", format_deallocation(view));
    }

    fn on_release(&self, view: &ResourceView<'_>) {
        let resource = view.resource();
        if resource.has_allocations() {
            println!("{}", self.banner(&format_release(view)));
            if !resource.is_no_abort() {
                std::process::abort();
            }
        }
    }

    fn on_invalid_block(&self, _view: &ResourceView<'_>, report: &InvalidBlockReport) {
        print!("{}", self.banner(&format_invalid_block(report)));
    }

    fn on_print(&self, view: &ResourceView<'_>) {
        print!("{}", format_print(view));
        let _ = io::stdout().flush();
    }

    fn on_log(&self, message: std::fmt::Arguments<'_>) {
        println!("{message}");
    }
}

/// Reporter that appends events to a file.
///
/// While no file is open every event is silently dropped and the
/// resource keeps working; open and close at will.
#[derive(Debug, Default)]
pub struct FileReporter {
    file: Mutex<Option<BufWriter<File>>>,
}

impl FileReporter {
    /// A reporter with no open file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates (or truncates) `path` and opens the reporter onto it.
    pub fn create(path: impl AsRef<Path>) -> io::Result<Self> {
        let reporter = Self::new();
        reporter.open(path)?;
        Ok(reporter)
    }

    /// Opens `path`, replacing any previously open file.
    pub fn open(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let file = File::create(path)?;
        *self.lock() = Some(BufWriter::new(file));
        Ok(())
    }

    /// Flushes and closes the current file, if any.
    pub fn close(&self) -> io::Result<()> {
        let mut guard = self.lock();
        if let Some(mut writer) = guard.take() {
            writer.flush()?;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.lock().is_some()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<BufWriter<File>>> {
        self.file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write_event(&self, text: &str) {
        let mut guard = self.lock();
        if let Some(writer) = guard.as_mut() {
            let outcome = writeln!(writer, "{text}").and_then(|_| writer.flush());
            if let Err(err) = outcome {
                eprintln!("memprobe: file reporter write failed: {err}");
            }
        }
    }
}

impl ProbeReporter for FileReporter {
    fn on_allocation(&self, view: &ResourceView<'_>) {
        self.write_event(&format_allocation(view));
    }

    fn on_deallocation(&self, view: &ResourceView<'_>) {
        self.write_event(&format_deallocation(view));
    }

    fn on_release(&self, view: &ResourceView<'_>) {
        let resource = view.resource();
        if !resource.has_allocations() {
            return;
        }
        let mut guard = self.lock();
        let Some(writer) = guard.as_mut() else {
            // Closed file: the whole event is dropped, abort included.
            return;
        };
        let outcome = writeln!(writer, "{}", format_release(view)).and_then(|_| writer.flush());
        if let Err(err) = outcome {
            eprintln!("memprobe: file reporter write failed: {err}");
        }
        drop(guard);
        if !resource.is_no_abort() {
            std::process::abort();
        }
    }

    fn on_invalid_block(&self, _view: &ResourceView<'_>, report: &InvalidBlockReport) {
        self.write_event(format_invalid_block(report).trim_end_matches('\n'));
    }

    fn on_print(&self, view: &ResourceView<'_>) {
        self.write_event(format_print(view).trim_end_matches('\n'));
    }

    fn on_log(&self, message: std::fmt::Arguments<'_>) {
        self.write_event(&message.to_string());
    }
}

#[derive(Serialize)]
struct JsonEvent<'a> {
    event: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    address: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bytes: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alignment: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    index: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    underrun_by: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    overrun_by: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<StatsSnapshot>,
}

impl<'a> JsonEvent<'a> {
    fn new(event: &'a str) -> Self {
        Self {
            event,
            address: None,
            bytes: None,
            alignment: None,
            index: None,
            underrun_by: None,
            overrun_by: None,
            message: None,
            stats: None,
        }
    }
}

/// Reporter that emits one JSON object per event on standard output,
/// for machine consumption in CI pipelines and log processors.
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonReporter;

impl JsonReporter {
    fn emit(event: &JsonEvent<'_>) {
        match serde_json::to_string(event) {
            Ok(line) => println!("{line}"),
            Err(err) => eprintln!("memprobe: json reporter serialization failed: {err}"),
        }
    }
}

impl ProbeReporter for JsonReporter {
    fn on_allocation(&self, view: &ResourceView<'_>) {
        let r = view.resource();
        let mut event = JsonEvent::new("allocation");
        event.address = Some(r.last_allocated_address() as usize);
        event.bytes = Some(r.last_allocated_bytes());
        event.alignment = Some(r.last_allocated_alignment());
        event.index = Some(r.last_allocated_index());
        event.stats = Some(view.snapshot());
        Self::emit(&event);
    }

    fn on_deallocation(&self, view: &ResourceView<'_>) {
        let r = view.resource();
        let mut event = JsonEvent::new("deallocation");
        event.address = Some(r.last_deallocated_address() as usize);
        event.bytes = Some(r.last_deallocated_bytes());
        event.alignment = Some(r.last_deallocated_alignment());
        event.index = Some(r.last_deallocated_index());
        event.stats = Some(view.snapshot());
        Self::emit(&event);
    }

    fn on_release(&self, view: &ResourceView<'_>) {
        let resource = view.resource();
        if !resource.has_allocations() {
            return;
        }
        let mut event = JsonEvent::new("leak");
        event.stats = Some(view.snapshot());
        Self::emit(&event);
        if !resource.is_no_abort() {
            std::process::abort();
        }
    }

    fn on_invalid_block(&self, view: &ResourceView<'_>, report: &InvalidBlockReport) {
        let mut event = JsonEvent::new("invalid_block");
        event.address = Some(report.payload_address);
        event.bytes = Some(report.claimed_bytes);
        event.alignment = Some(report.claimed_alignment);
        event.underrun_by = Some(report.underrun_by);
        event.overrun_by = Some(report.overrun_by);
        event.stats = Some(view.snapshot());
        Self::emit(&event);
    }

    fn on_print(&self, view: &ResourceView<'_>) {
        let mut event = JsonEvent::new("print");
        event.stats = Some(view.snapshot());
        Self::emit(&event);
    }

    fn on_log(&self, message: std::fmt::Arguments<'_>) {
        let mut event = JsonEvent::new("log");
        event.message = Some(message.to_string());
        Self::emit(&event);
    }
}
