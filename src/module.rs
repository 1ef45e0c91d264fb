// File: src/module.rs
//
// The `use` importer. A package path is a glob resolved first against
// the current working directory and then against $PLUTO/packages;
// `.pluto` files match directly and a directory expands to the
// same-named file inside it. Each resolved source is parsed, compiled,
// and executed into a child store, which is then merged into the
// importing store as a single module Map.

use crate::compiler::Compiler;
use crate::errors::{ErrorKind, PlutoError};
use crate::lexer::tokenize;
use crate::parser::Parser;
use crate::store::Store;
use crate::vm::Vm;
use crate::{builtins, bytecode};
use std::cell::RefCell;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// Source-file extension for Pluto packages
const EXTENSION: &str = "pluto";

/// The packages root: `$PLUTO` when set, else `<home>/pluto`
pub fn pluto_root() -> PathBuf {
    match env::var("PLUTO") {
        Ok(path) if !path.is_empty() => PathBuf::from(path),
        _ => dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join("pluto"),
    }
}

/// Expand a glob pattern to the matching paths, in alphabetical order.
/// An unreadable or malformed pattern simply matches nothing; the
/// caller reports the empty result as NotFound.
fn expand(base: &Path) -> Vec<PathBuf> {
    match glob::glob(&base.to_string_lossy()) {
        Ok(paths) => paths.flatten().collect(),
        Err(_) => Vec::new(),
    }
}

/// Find the `.pluto` sources a package glob names, relative to `dir`.
/// Directories expand to `<dir>/<dir>.pluto`.
pub fn locate_sources(dir: &Path, pkg: &str) -> Result<Vec<PathBuf>, PlutoError> {
    // `./pkg` is explicitly relative to the importing directory
    let pkg = pkg.strip_prefix("./").unwrap_or(pkg);
    let base = dir.join(pkg);

    let mut sources = Vec::new();

    for file in expand(&base) {
        let Ok(stat) = fs::metadata(&file) else { continue };

        if !stat.is_dir() {
            if file.extension().map(|e| e == EXTENSION).unwrap_or(false) {
                sources.push(file);
            }
            continue;
        }

        if let Some(name) = file.file_name() {
            let inner = file.join(format!("{}.{}", name.to_string_lossy(), EXTENSION));

            if inner.is_file() {
                sources.push(inner);
            }
        }
    }

    if sources.is_empty() {
        return Err(PlutoError::new(
            ErrorKind::NotFound,
            format!("use: no sources found at {}", pkg),
        ));
    }

    Ok(sources)
}

/// Locate sources in the current directory first, falling back to
/// `$PLUTO/packages`
pub fn locate_any_sources(pkg: &str) -> Result<Vec<PathBuf>, PlutoError> {
    let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));

    match locate_sources(&cwd, pkg) {
        Ok(sources) => Ok(sources),
        Err(_) => locate_sources(&pluto_root().join("packages"), pkg),
    }
}

/// The USE effector: resolve the glob and bring each source in
pub fn import(vm: &mut Vm, fi: usize, pkg: &str) {
    let sources = match locate_any_sources(pkg) {
        Ok(sources) => sources,
        Err(error) => {
            vm.error = Some(error);
            return;
        }
    };

    import_files(vm, fi, &sources);
}

/// Import the standard packages before user code runs. A missing
/// prelude is not an error — a bare checkout has no packages installed.
pub fn import_prelude(vm: &mut Vm, fi: usize) {
    let packages = pluto_root().join("packages");

    let Ok(sources) = locate_sources(&packages, "std/*") else { return };
    import_files(vm, fi, &sources);
}

fn import_files(vm: &mut Vm, fi: usize, sources: &[PathBuf]) {
    for source in sources {
        import_file(vm, fi, source);

        if vm.error.is_some() {
            return;
        }
    }
}

/// Compile and execute one source file into a child store, then merge
/// it into the importing frame's store. Already-imported sources come
/// out of the cache: the module value is re-bound without executing
/// the package a second time.
fn import_file(vm: &mut Vm, fi: usize, source: &Path) {
    let key = source.to_string_lossy().to_string();

    let cached = vm.imports.borrow().modules.get(&key).cloned();
    if let Some((name, module)) = cached {
        vm.frame_store(fi).borrow_mut().define(&name, module, false);
        return;
    }

    if vm.imports.borrow().loading.contains(&key) {
        vm.error = Some(PlutoError::new(
            ErrorKind::Unknown,
            format!("circular import detected: {}", key),
        ));
        return;
    }

    let text = match fs::read_to_string(source) {
        Ok(text) => text,
        Err(err) => {
            vm.error = Some(PlutoError::new(ErrorKind::Unknown, err.to_string()));
            return;
        }
    };

    let mut parser = Parser::new(tokenize(&text)).with_file(key.clone());
    let program = parser.parse();

    if let Some(first) = parser.errors.into_iter().next() {
        vm.error = Some(first);
        return;
    }

    let mut compiler = Compiler::new();
    if let Err(error) = compiler.compile_program(&program) {
        vm.error = Some(error);
        return;
    }

    let code = match bytecode::read(&compiler.bytes) {
        Ok(code) => code,
        Err(error) => {
            vm.error = Some(error);
            return;
        }
    };

    // The child store starts with the importer's bindings, re-flagged
    // as absorbed so only the package's own definitions merge back
    let locals = vm.frame_store(fi);
    let mut child = Store::new();

    {
        let caller = locals.borrow();
        child.data = caller
            .data
            .iter()
            .map(|binding| {
                let mut binding = binding.clone();
                binding.local = false;
                binding
            })
            .collect();
    }

    builtins::register(&mut child);
    compiler.install(&mut child);

    let child = Rc::new(RefCell::new(child));
    let constants = Rc::new(std::mem::take(&mut compiler.constants));

    vm.imports.borrow_mut().loading.push(key.clone());

    let mut machine = Vm::with_imports(Rc::clone(&vm.imports));
    machine.run(Rc::new(code), Rc::clone(&child), constants, false);

    vm.imports.borrow_mut().loading.pop();

    if let Some(error) = machine.error {
        vm.error = Some(error);
        return;
    }

    let fallback = source
        .file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "module".to_string());

    let (name, module) = locals.borrow_mut().import_module(&child.borrow(), &fallback);
    vm.imports.borrow_mut().modules.insert(key, (name, module));
}
