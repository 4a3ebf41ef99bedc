/*
 * Runs the interpreter over test ASL files:
 *      - ASL files are compiled with `iasl`, unless an up-to-date AML file already sits next to them
 *      - each AML file is loaded as a table, and its `\MAIN` method (or the method given with `--method`) is run
 *      - a `\MAIN` that returns a non-zero integer counts as a failure, so tests can check their own results
 *      - a summary table of every file is printed at the end, like `cargo test` does
 */

use aml_engine::{namespace::AmlName, object::Object, AmlError, Handle, Interpreter, InterpreterConfig, ParsePolicy};
use clap::{Arg, ArgAction, ArgGroup};
use pci_types::PciAddress;
use std::{
    collections::{BTreeMap, HashMap},
    ffi::OsStr,
    fs,
    io::Write,
    path::{Path, PathBuf},
    process::Command,
    str::FromStr,
    sync::{
        atomic::{AtomicU32, Ordering},
        Condvar,
        Mutex,
    },
    time::{Duration, Instant},
};

const AML_TABLE_HEADER_LENGTH: usize = 36;

enum Source {
    Ignored,
    Aml(PathBuf),
    CompileFailed(PathBuf),
    NotCompiled(PathBuf),
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum Outcome {
    Pass,
    /// `iasl` rejected the ASL.
    CompileFail,
    /// The ASL needed compiling, but we weren't able to.
    NotCompiled,
    /// The table failed to load, or the test method returned an error.
    Fail,
    /// The test method ran, but returned a non-zero value.
    WrongResult,
}

fn main() -> std::io::Result<()> {
    let mut cmd = clap::Command::new("aml_tester")
        .version("v0.2.0")
        .about("Compiles ASL test files and runs them through the AML interpreter")
        .arg(Arg::new("no_compile").long("no-compile").action(ArgAction::SetTrue).help("Don't compile ASL to AML"))
        .arg(
            Arg::new("combined")
                .long("combined")
                .action(ArgAction::SetTrue)
                .help("Load every file into the same namespace, instead of a fresh interpreter for each"),
        )
        .arg(
            Arg::new("at_init")
                .long("at-init")
                .action(ArgAction::SetTrue)
                .help("Check every method once its table has loaded, rather than on first invocation"),
        )
        .arg(
            Arg::new("method")
                .short('m')
                .long("method")
                .action(ArgAction::Set)
                .default_value("\\MAIN")
                .help("The method to run after loading each file"),
        )
        .arg(Arg::new("path").short('p').long("path").required(false).action(ArgAction::Set).value_name("DIR"))
        .arg(Arg::new("files").action(ArgAction::Append).value_name("FILE.{asl,aml}"))
        .group(ArgGroup::new("files_list").args(["path", "files"]).required(true));
    if std::env::args().count() <= 1 {
        cmd.print_help()?;
        return Ok(());
    }
    log::set_logger(&Logger).unwrap();
    log::set_max_level(log::LevelFilter::Trace);

    let matches = cmd.get_matches();

    let wants_compile = !matches.get_flag("no_compile");
    let can_compile = wants_compile && Command::new("iasl").arg("-v").status().is_ok_and(|status| status.success());

    let method = match AmlName::from_str(matches.get_one::<String>("method").unwrap()) {
        Ok(method) => method,
        Err(err) => panic!("Invalid method path: {:?}", err),
    };
    let config = InterpreterConfig {
        parse_policy: if matches.get_flag("at_init") { ParsePolicy::AtInit } else { ParsePolicy::JustInTime },
        ..InterpreterConfig::default()
    };

    let mut sources = Vec::new();
    for path in find_tests(&matches)? {
        sources.push(prepare(&path, can_compile)?);
    }
    if wants_compile && sources.iter().any(|source| matches!(source, Source::NotCompiled(_))) {
        panic!("`iasl` is not installed, but some ASL files need compiling! Pass --no-compile, or install `iasl`");
    }

    let mut results: BTreeMap<PathBuf, Outcome> = BTreeMap::new();
    let mut interpreter = Interpreter::with_config(Handler::new(), 2, config.clone());

    for source in sources {
        let path = match source {
            Source::Aml(path) => path,
            Source::CompileFailed(path) => {
                results.insert(path, Outcome::CompileFail);
                continue;
            }
            Source::NotCompiled(path) => {
                results.insert(path, Outcome::NotCompiled);
                continue;
            }
            Source::Ignored => continue,
        };
        if results.contains_key(&path) {
            continue;
        }

        print!("Testing AML file: {:?}... ", path);
        std::io::stdout().flush()?;

        let contents = fs::read(&path)?;
        if !matches.get_flag("combined") {
            interpreter = Interpreter::with_config(Handler::new(), 2, config.clone());
        }

        let outcome = match contents.get(AML_TABLE_HEADER_LENGTH..) {
            Some(stream) => run_test(&interpreter, stream, &method),
            None => {
                println!("{}Too short to be a table{}", termion::color::Fg(termion::color::Red), termion::style::Reset);
                Outcome::Fail
            }
        };
        println!("Namespace: {}", interpreter.namespace.lock());
        results.insert(path, outcome);
    }

    println!("Summary:");
    for (path, outcome) in results.iter() {
        println!("\t{:<50}: {}", path.display(), describe(*outcome));
    }

    let passed = results.values().filter(|outcome| **outcome == Outcome::Pass).count();
    println!(
        "\nTest results: {}{} passed{}, {}{} failed{}",
        termion::color::Fg(termion::color::Green),
        passed,
        termion::style::Reset,
        termion::color::Fg(termion::color::Red),
        results.len() - passed,
        termion::style::Reset
    );
    Ok(())
}

fn run_test(interpreter: &Interpreter, stream: &[u8], method: &AmlName) -> Outcome {
    let result = interpreter.load_table(stream).and_then(|()| interpreter.evaluate_if_present(method.clone(), vec![]));

    match result {
        Ok(None) => {
            println!("{}OK (no {}){}", termion::color::Fg(termion::color::Green), method, termion::style::Reset);
            Outcome::Pass
        }
        Ok(Some(value)) => {
            let value = value.lock();
            match *value {
                Object::Integer(code) if code != 0 => {
                    println!(
                        "{}Failed (returned {:#x}){}",
                        termion::color::Fg(termion::color::Red),
                        code,
                        termion::style::Reset
                    );
                    Outcome::WrongResult
                }
                _ => {
                    println!("{}OK{} ({})", termion::color::Fg(termion::color::Green), termion::style::Reset, *value);
                    Outcome::Pass
                }
            }
        }
        Err(err) => {
            println!("{}Failed ({:?}){}", termion::color::Fg(termion::color::Red), err, termion::style::Reset);
            Outcome::Fail
        }
    }
}

fn describe(outcome: Outcome) -> String {
    let green = termion::color::Fg(termion::color::Green);
    let red = termion::color::Fg(termion::color::Red);
    let reset = termion::style::Reset;
    match outcome {
        Outcome::Pass => format!("{green}OK{reset}"),
        Outcome::CompileFail => format!("{red}COMPILE FAIL{reset}"),
        Outcome::NotCompiled => format!("{}NOT COMPILED{reset}", termion::color::Fg(termion::color::Yellow)),
        Outcome::Fail => format!("{red}FAIL{reset}"),
        Outcome::WrongResult => format!("{red}WRONG RESULT{reset}"),
    }
}

fn find_tests(matches: &clap::ArgMatches) -> std::io::Result<Vec<PathBuf>> {
    let files: Vec<PathBuf> = match matches.get_one::<String>("path") {
        Some(path) => {
            let path = Path::new(path);
            if fs::metadata(path)?.is_dir() {
                println!("Running tests in directory: {:?}", path);
                let mut files =
                    fs::read_dir(path)?.filter_map(|entry| entry.ok()).map(|entry| entry.path()).collect::<Vec<_>>();
                files.sort();
                files
            } else {
                println!("Running single test: {:?}", path);
                vec![path.to_path_buf()]
            }
        }
        None => matches.get_many::<String>("files").unwrap_or_default().map(PathBuf::from).collect(),
    };

    for path in files.iter() {
        if !path.is_file() {
            println!("Not a regular file: {}", path.display());
            path.metadata()?;
        }
    }
    Ok(files)
}

/// Work out what to run for `path`. ASL files are compiled, unless the AML next to them is newer.
fn prepare(path: &Path, can_compile: bool) -> std::io::Result<Source> {
    match path.extension().and_then(OsStr::to_str) {
        Some("aml") => return Ok(Source::Aml(path.to_path_buf())),
        Some("asl") => (),
        _ => return Ok(Source::Ignored),
    }

    let aml_path = path.with_extension("aml");
    if aml_path.is_file() && path.metadata()?.modified()? <= aml_path.metadata()?.modified()? {
        return Ok(Source::Aml(aml_path));
    }
    if !can_compile {
        return Ok(Source::NotCompiled(path.to_path_buf()));
    }

    println!("Compiling file: {}", path.display());
    let output = Command::new("iasl").arg(path).output()?;
    if output.status.success() {
        Ok(Source::Aml(aml_path))
    } else {
        println!(
            "Failed to compile ASL file: {}. Output from iasl:\n {}",
            path.display(),
            String::from_utf8_lossy(&output.stderr)
        );
        Ok(Source::CompileFailed(path.to_path_buf()))
    }
}

struct Logger;

impl log::Log for Logger {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        println!("[{}] {}", record.level(), record.args());
    }

    fn flush(&self) {
        std::io::stdout().flush().unwrap();
    }
}

/// A pretend machine. Memory reads back what was last written to it, and everything else reads as zero. Accesses
/// are logged so tests can be followed along.
struct Handler {
    memory: Mutex<HashMap<usize, u8>>,
    semaphores: Mutex<HashMap<u32, (u32, u32)>>,
    semaphore_changed: Condvar,
    next_semaphore: AtomicU32,
    start: Instant,
}

impl Handler {
    fn new() -> Handler {
        Handler {
            memory: Mutex::new(HashMap::new()),
            semaphores: Mutex::new(HashMap::new()),
            semaphore_changed: Condvar::new(),
            next_semaphore: AtomicU32::new(0),
            start: Instant::now(),
        }
    }

    fn read_memory(&self, address: usize, length: usize) -> u64 {
        let memory = self.memory.lock().unwrap();
        let value = (0..length)
            .rev()
            .fold(0u64, |value, i| (value << 8) | memory.get(&(address + i)).copied().unwrap_or(0) as u64);
        println!("read_u{} {address:#x} -> {value:#x}", length * 8);
        value
    }

    fn write_memory(&self, address: usize, length: usize, value: u64) {
        println!("write_u{} {address:#x}<-{value:#x}", length * 8);
        let mut memory = self.memory.lock().unwrap();
        for i in 0..length {
            memory.insert(address + i, (value >> (i * 8)) as u8);
        }
    }
}

impl aml_engine::Handler for Handler {
    fn read_u8(&self, address: usize) -> u8 {
        self.read_memory(address, 1) as u8
    }
    fn read_u16(&self, address: usize) -> u16 {
        self.read_memory(address, 2) as u16
    }
    fn read_u32(&self, address: usize) -> u32 {
        self.read_memory(address, 4) as u32
    }
    fn read_u64(&self, address: usize) -> u64 {
        self.read_memory(address, 8)
    }

    fn write_u8(&self, address: usize, value: u8) {
        self.write_memory(address, 1, value as u64)
    }
    fn write_u16(&self, address: usize, value: u16) {
        self.write_memory(address, 2, value as u64)
    }
    fn write_u32(&self, address: usize, value: u32) {
        self.write_memory(address, 4, value as u64)
    }
    fn write_u64(&self, address: usize, value: u64) {
        self.write_memory(address, 8, value)
    }

    fn read_io_u8(&self, port: u16) -> u8 {
        println!("read_io_u8 {port:#x}");
        0
    }
    fn read_io_u16(&self, port: u16) -> u16 {
        println!("read_io_u16 {port:#x}");
        0
    }
    fn read_io_u32(&self, port: u16) -> u32 {
        println!("read_io_u32 {port:#x}");
        0
    }

    fn write_io_u8(&self, port: u16, value: u8) {
        println!("write_io_u8 {port:#x}<-{value:#x}");
    }
    fn write_io_u16(&self, port: u16, value: u16) {
        println!("write_io_u16 {port:#x}<-{value:#x}");
    }
    fn write_io_u32(&self, port: u16, value: u32) {
        println!("write_io_u32 {port:#x}<-{value:#x}");
    }

    fn read_pci_u8(&self, address: PciAddress, offset: u16) -> u8 {
        println!("read_pci_u8 ({address}, {offset:#x})");
        0
    }
    fn read_pci_u16(&self, address: PciAddress, offset: u16) -> u16 {
        println!("read_pci_u16 ({address}, {offset:#x})");
        0
    }
    fn read_pci_u32(&self, address: PciAddress, offset: u16) -> u32 {
        println!("read_pci_u32 ({address}, {offset:#x})");
        0
    }

    fn write_pci_u8(&self, address: PciAddress, offset: u16, value: u8) {
        println!("write_pci_u8 ({address}, {offset:#x})<-{value:#x}");
    }
    fn write_pci_u16(&self, address: PciAddress, offset: u16, value: u16) {
        println!("write_pci_u16 ({address}, {offset:#x})<-{value:#x}");
    }
    fn write_pci_u32(&self, address: PciAddress, offset: u16, value: u32) {
        println!("write_pci_u32 ({address}, {offset:#x})<-{value:#x}");
    }

    fn nanos_since_boot(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    fn stall(&self, microseconds: u64) {
        println!("Stalling for {}us", microseconds);
        std::thread::sleep(Duration::from_micros(microseconds));
    }
    fn sleep(&self, milliseconds: u64) {
        println!("Sleeping for {}ms", milliseconds);
    }

    fn create_semaphore(&self, max_units: u32, initial_units: u32) -> Handle {
        let handle = self.next_semaphore.fetch_add(1, Ordering::Relaxed);
        self.semaphores.lock().unwrap().insert(handle, (initial_units, max_units));
        Handle(handle)
    }

    fn wait_semaphore(&self, semaphore: Handle, units: u32, timeout: u16) -> Result<(), AmlError> {
        let deadline = Instant::now() + Duration::from_millis(timeout as u64);
        let mut semaphores = self.semaphores.lock().unwrap();
        loop {
            let (available, _) = semaphores.get_mut(&semaphore.0).ok_or(AmlError::NoSuchHandler)?;
            if *available >= units {
                *available -= units;
                return Ok(());
            }

            if timeout == 0xffff {
                semaphores = self.semaphore_changed.wait(semaphores).unwrap();
            } else {
                let now = Instant::now();
                if now >= deadline {
                    return Err(AmlError::Timeout);
                }
                semaphores = self.semaphore_changed.wait_timeout(semaphores, deadline - now).unwrap().0;
            }
        }
    }

    fn signal_semaphore(&self, semaphore: Handle, units: u32) {
        if let Some((available, max)) = self.semaphores.lock().unwrap().get_mut(&semaphore.0) {
            *available = u32::min(available.saturating_add(units), *max);
        }
        self.semaphore_changed.notify_all();
    }

    fn delete_semaphore(&self, semaphore: Handle) {
        self.semaphores.lock().unwrap().remove(&semaphore.0);
    }
}
