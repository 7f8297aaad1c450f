use std::{
    env,
    io::{self, Write},
    path::PathBuf,
    process, time,
};

use duosig::{
    config::{Config, KeyMaterial},
    device::ledger::LedgerDevice,
    explorer::esplora::EsploraClient,
    run_spend,
    signer::HotSigner,
    VERSION,
};

fn print_help_exit(code: i32) {
    eprintln!("duosig version {}", VERSION);
    eprintln!("One-shot spender for a 2-of-2 multisig between a hardware signing device and a hot key.");
    eprintln!("By default duosig looks for a 'duosig.toml' file in its configuration directory. A different one may be provided like so: '--conf <config file path>'. With no configuration file at all, built-in demonstration settings apply: Bitcoin testnet, a 500 sats fee and a well-known hot key seed.");
    eprintln!("Plug the signing device and open the Bitcoin app on it before running.");
    process::exit(code);
}

fn print_version() {
    eprintln!("{}", VERSION);
    process::exit(0);
}

fn parse_args(args: Vec<String>) -> Option<PathBuf> {
    if args.len() == 1 {
        return None;
    }

    if args[1] == "--help" || args[1] == "-h" {
        print_help_exit(0)
    } else if args[1] == "--version" || args[1] == "-v" {
        print_version()
    } else if args[1] != "--conf" {
        eprintln!("Only a single command line argument is supported: --conf. All other configuration parameters must be specified in the configuration file.");
        print_help_exit(1);
    }

    if args.len() != 3 {
        print_help_exit(1);
    }

    Some(PathBuf::from(args[2].to_owned()))
}

fn setup_logger(log_level: log::LevelFilter) -> Result<(), fern::InitError> {
    let dispatcher = fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}] {}",
                time::SystemTime::now()
                    .duration_since(time::UNIX_EPOCH)
                    .unwrap_or_else(|e| {
                        println!("Can't get time since epoch: '{}'. Using a dummy value.", e);
                        time::Duration::from_secs(0)
                    })
                    .as_secs(),
                record.target(),
                record.level(),
                message
            ))
        })
        .level(log_level);

    dispatcher.chain(std::io::stdout()).apply()?;

    Ok(())
}

fn main() {
    let args = env::args().collect();
    let conf_file = parse_args(args);

    let config = Config::from_file(conf_file).unwrap_or_else(|e| {
        eprintln!("Error parsing config: {}", e);
        print_help_exit(1);
        unreachable!();
    });
    setup_logger(config.log_level).unwrap_or_else(|e| {
        eprintln!("Error setting up logger: {}", e);
        process::exit(1);
    });

    let network = config.bitcoin_config.network;
    let local_signer = match &config.local_signer.key_material {
        KeyMaterial::Seed(seed) => {
            if *seed == vec![0xab; 32] {
                log::warn!(
                    "Using the built-in demonstration seed. Anyone can spend coins sent to this wallet."
                );
            }
            HotSigner::from_seed(network, seed)
        }
        KeyMaterial::Mnemonic(words) => HotSigner::from_mnemonic(network, words),
    }
    .unwrap_or_else(|e| {
        log::error!("Error creating the local signer: {}", e);
        process::exit(1);
    });

    let device = LedgerDevice::connect_hid().unwrap_or_else(|e| {
        log::error!("Error connecting to the signing device: {}", e);
        process::exit(1);
    });
    let explorer = EsploraClient::new(&config.explorer_config.base_url);

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap_or_else(|e| {
            log::error!("Error setting up the runtime: {}", e);
            process::exit(1);
        });
    let summary = rt
        .block_on(run_spend(&device, &local_signer, &explorer, &config))
        .unwrap_or_else(|e| {
            log::error!("Error running the spend: {}", e);
            process::exit(1);
        });

    println!("Deposit address: {}", summary.deposit_address);
    println!(
        "Sent {} in transaction {}. See {}/tx/{}.",
        summary.amount, summary.txid, config.explorer_config.base_url, summary.txid
    );

    // We log to stdout, make sure all messages were actually written out.
    io::stdout().flush().expect("Flushing stdout");
}
