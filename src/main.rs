use dex_transform::dex::{DexCode, DexMethod, Error, MethodId};
use dex_transform::transform::{PostOrderSort, TransformRegistry};

use clap::{Arg, ArgAction, Command};
use std::fs;

fn main() -> Result<(), Error> {
    env_logger::init();

    let matches = Command::new("Dalvik method transformer")
        .version(clap::crate_version!())
        .about("Balloon a Dalvik `code_item` into editable form and sync it back")
        .arg(
            Arg::new("output")
                .long("output")
                .value_name("FILE")
                .help("Write the re-encoded `code_item` to this file"),
        )
        .arg(
            Arg::new("cfg")
                .long("cfg")
                .action(ArgAction::SetTrue)
                .help("Print the basic blocks and their postorder"),
        )
        .arg(
            Arg::new("dump")
                .long("dump")
                .action(ArgAction::SetTrue)
                .help("Print every node of the ballooned method"),
        )
        .arg(
            Arg::new("INPUT")
                .help("Sets the input `code_item` file to use")
                .required(true)
                .index(1),
        )
        .get_matches();

    let input = matches.get_one::<String>("INPUT").unwrap();
    let want_cfg = matches.get_flag("cfg");

    log::info!("Reading '{}'", input);
    let bytes = fs::read(input).map_err(Error::IoError)?;
    let code = DexCode::from_bytes(&bytes)?;
    log::info!(
        "{} registers ({} ins), {} code units, {} try items",
        code.registers_size,
        code.ins_size,
        code.insns.len(),
        code.tries.len()
    );
    let method = DexMethod::new(MethodId(0), input.as_str(), Some(code));

    let mut registry = TransformRegistry::new();
    {
        let transform = registry.load_method_transform(&method, want_cfg)?;
        let transform = transform.lock();

        if matches.get_flag("dump") {
            for (id, entry) in transform.iter() {
                println!("{:>6} {:?}: {:?}", entry.addr, id, entry.item);
            }
        }

        if let Some(blocks) = transform.cfg() {
            for block in blocks {
                println!(
                    "block {}{}: preds {:?} succs {:?}",
                    block.id,
                    if block.is_catch() { " (catch)" } else { "" },
                    block.preds,
                    block.succs
                );
            }
            println!("postorder: {:?}", PostOrderSort::new(blocks).get());
        }
    }

    registry.sync_all();

    if let Some(output) = matches.get_one::<String>("output") {
        if let Some(code) = method.code() {
            log::info!("Writing '{}'", output);
            fs::write(output, code.to_bytes()).map_err(Error::IoError)?;
        }
    }

    Ok(())
}
