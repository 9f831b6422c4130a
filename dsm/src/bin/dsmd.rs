//
// Copyright (c) 2017, 2020 ADLINK Technology Inc.
//
// This program and the accompanying materials are made available under the
// terms of the Eclipse Public License 2.0 which is available at
// http://www.eclipse.org/legal/epl-2.0, or the Apache License, Version 2.0
// which is available at https://www.apache.org/licenses/LICENSE-2.0.
//
// SPDX-License-Identifier: EPL-2.0 OR Apache-2.0
//
// Contributors:
//   ADLINK zenoh team, <zenoh@adlink-labs.tech>
//
use clap::{App, Arg, ArgMatches};
use dsm::arena::Arena;
use dsm::{DsmConfig, DsmServer};

fn main() {
    env_logger::init();

    let args = App::new("The dsm server")
        .version(env!("CARGO_PKG_VERSION"))
        .arg(Arg::from_usage(
            "-c, --config=[FILE] \
             'The configuration file. Currently, this file must be a valid JSON file.'",
        ))
        .arg(Arg::from_usage(
            "-i, --id=[ID] \
             'The identity of this server (0 to 15). Selects the arena name and the fetch port.'",
        ))
        .arg(Arg::from_usage(
            "-p, --prefix=[PREFIX] \
             'The prefix of the arena name.'",
        ))
        .arg(Arg::from_usage(
            "-b, --base-port=[PORT] \
             'The base UDP port of the fetch responders. Server N answers on base port + N.'",
        ))
        .arg(Arg::from_usage(
            "-l, --listen=[IPV4] \
             'The address the fetch responder binds to.'",
        ))
        .arg(Arg::from_usage(
            "-t, --token=[TOKEN] \
             'The token clients must present to register buffers.'",
        ))
        .arg(Arg::from_usage(
            "--no-wait \
             'Start serving at once instead of waiting for a first client.'",
        ))
        .arg(Arg::from_usage(
            "--no-remote \
             'Do not answer the fetch requests of remote servers.'",
        ))
        .arg(Arg::from_usage(
            "--clean \
             'Unlink an arena left behind by a server that did not shut down properly.'",
        ))
        .get_matches();

    let config = match config_from_args(&args) {
        Ok(config) => config,
        Err(e) => {
            println!("{}. Exiting...", e);
            std::process::exit(-1);
        }
    };
    log::info!("Initial conf: {:?}", config);

    if args.is_present("clean") {
        match Arena::destroy(&config.arena_name()) {
            Ok(()) => log::info!("Removed stale arena {}", config.arena_name()),
            Err(e) => log::debug!("{}", e),
        }
    }

    let mut server = match DsmServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            println!("{}. Exiting...", e);
            std::process::exit(-1);
        }
    };
    if let Err(e) = server.run() {
        println!("{}. Exiting...", e);
        std::process::exit(-1);
    }
}

fn config_from_args(args: &ArgMatches) -> Result<DsmConfig, String> {
    let mut config = match args.value_of("config") {
        Some(file) => DsmConfig::from_file(file).map_err(|e| e.to_string())?,
        None => DsmConfig::default(),
    };
    if let Some(id) = args.value_of("id") {
        config.server_id = id.parse().map_err(|e| format!("Invalid id {}: {}", id, e))?;
    }
    if let Some(prefix) = args.value_of("prefix") {
        config.arena_prefix = prefix.to_string();
    }
    if let Some(port) = args.value_of("base-port") {
        config.request_base_port = port
            .parse()
            .map_err(|e| format!("Invalid base port {}: {}", port, e))?;
    }
    if let Some(addr) = args.value_of("listen") {
        config.listen_address = addr
            .parse()
            .map_err(|e| format!("Invalid listen address {}: {}", addr, e))?;
    }
    if let Some(token) = args.value_of("token") {
        config.token = Some(token.to_string());
    }
    if args.is_present("no-wait") {
        config.wait_for_client = false;
    }
    if args.is_present("no-remote") {
        config.serve_remote = false;
    }
    config.validate().map_err(|e| e.to_string())?;
    Ok(config)
}
