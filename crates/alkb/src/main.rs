use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use alkb_vm::Vm;

/// Run a compiled `.alkb` bytecode module.
#[derive(Parser)]
#[command(name = "alkb")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the module file
    module: PathBuf,

    /// Entry function to execute
    #[arg(default_value = "main")]
    function: String,

    /// Run one garbage collection before entering the interpreter
    #[arg(long)]
    force_gc: bool,

    /// Print garbage-collector statistics after the entry returns
    #[arg(long)]
    stats: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let module = match alkb_bytecode::load_file(&cli.module) {
        Ok(m) => m,
        Err(e) => {
            eprintln!("alkb: {e}");
            return ExitCode::FAILURE;
        }
    };

    let mut vm = Vm::new();
    vm.bind_module(&module);

    if vm.param_count(&cli.function).unwrap_or(0) > 0 {
        eprintln!(
            "alkb: warning: function '{}' expects parameters, running with none",
            cli.function
        );
    }

    if cli.force_gc {
        vm.collect_garbage();
    }

    match vm.run(&cli.function, &[]) {
        Ok(result) => {
            println!("{result}");
            if cli.stats {
                print_gc_stats(&vm);
            }
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("alkb: {e}");
            ExitCode::FAILURE
        }
    }
}

fn print_gc_stats(vm: &Vm) {
    let stats = vm.gc_stats();
    println!("--- gc statistics ---");
    println!("collections:        {}", stats.collections);
    println!("total bytes freed:  {}", stats.total_bytes_freed);
    println!("total objects freed: {}", stats.total_objects_freed);
    println!("last cycle bytes:   {}", stats.last_bytes_freed);
    println!("last cycle objects: {}", stats.last_objects_freed);
    println!("allocated bytes:    {}", vm.bytes_allocated());
    println!("live objects:       {}", vm.live_objects());
}
