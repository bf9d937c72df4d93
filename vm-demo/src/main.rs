mod file_page_loader;

use std::{error::Error, path::PathBuf, process, sync::Arc, thread};

use clap::Parser;
use log::info;
use vm::{
    fs::HostFileSystem,
    page_loader::{ExecutableImage, ImageSection},
    Process, ShortTransferPolicy, VmConfig, VmKernel,
};

#[derive(Parser, Debug)]
#[command(
    name = "vm-demo",
    version,
    about = "Runs two processes through a small demand-paged memory"
)]
struct Cli {
    #[arg(long = "frames", default_value_t = 4, help = "Physical frames")]
    frames: usize,

    #[arg(long = "page-size", default_value_t = 256, help = "Bytes per page")]
    page_size: usize,

    #[arg(long = "strict", help = "Fail on short swap transfers instead of logging them")]
    strict: bool,

    #[arg(long = "swap-dir", default_value = ".", help = "Directory the swap file is created in")]
    swap_dir: PathBuf,

    #[arg(help = "Binary image to run; a built-in image is used when omitted")]
    image: Option<PathBuf>,
}

impl Cli {
    fn config(&self) -> VmConfig {
        let policy = if self.strict {
            ShortTransferPolicy::Fail
        } else {
            ShortTransferPolicy::Log
        };

        VmConfig::default()
            .with_frames(self.frames)
            .with_page_size(self.page_size)
            .with_stack_pages(2)
            .with_short_transfer(policy)
    }
}

/// Read-only text page and two data pages, each page tagged with its number.
fn builtin_image(page_size: usize) -> ExecutableImage {
    let data: Vec<u8> = (0..2 * page_size).map(|i| (i / page_size + 1) as u8).collect();

    ExecutableImage::new()
        .with_section(ImageSection::from_bytes(".text", 0, true, page_size, vec![0xC3; page_size]))
        .with_section(ImageSection::from_bytes(".data", 1, false, page_size, data))
}

/// Prints the first bytes of every page in hex.
fn dump(process: &Arc<Process>, page_size: usize) -> vm::Result<()> {
    let mut line = [0u8; 16];

    for vpn in 0..process.num_pages() {
        process.read_virtual_memory(vpn * page_size, &mut line)?;
        println!("pid {} vpn {:#04X}: {}", process.pid(), vpn, hex::encode(line));
    }

    Ok(())
}

fn run(cli: Cli) -> Result<(), Box<dyn Error>> {
    let config = cli.config();
    config.validate()?;
    let page_size = config.page_size;

    let kernel = VmKernel::new(config, Arc::new(HostFileSystem::new(&cli.swap_dir)));

    let workers: Vec<_> = (0..2u8)
        .map(|n| -> Result<_, Box<dyn Error>> {
            let image = match &cli.image {
                Some(path) => file_page_loader::load_image(path, page_size)?,
                None => builtin_image(page_size),
            };
            let process = Process::load(&kernel, image, &["demo", if n == 0 { "even" } else { "odd" }])?;
            info!("loaded pid {} ({} pages)", process.pid(), process.num_pages());

            Ok(thread::spawn(move || -> vm::Result<Arc<Process>> {
                let stamp = vec![0xA0 | n; page_size];
                // dirty every writable page so eviction has to go through swap
                for vpn in 1..process.num_pages() - 1 {
                    process.write_virtual_memory(vpn * page_size, &stamp[..page_size / 2])?;
                }
                Ok(process)
            }))
        })
        .collect::<Result<_, Box<dyn Error>>>()?;

    let mut processes = Vec::new();
    for worker in workers {
        let process = worker.join().map_err(|_| "worker thread panicked")??;
        processes.push(process);
    }

    for process in &processes {
        dump(process, page_size)?;
        if let Some(name) = process.read_virtual_memory_string(process.argv() + 4 * process.argc(), 64)? {
            println!("pid {} argv[0] = {:?}", process.pid(), name);
        }
    }

    kernel.audit();
    println!(
        "swap: {} slots, {} free",
        kernel.swap().total_slots(),
        kernel.swap().free_slots()
    );

    for process in &processes {
        process.exit();
    }
    kernel.terminate();

    Ok(())
}

fn main() {
    env_logger::init();

    if let Err(e) = run(Cli::parse()) {
        eprintln!("vm-demo: {}", e);
        process::exit(1);
    }
}
