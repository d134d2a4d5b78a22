#[macro_use] extern crate log;

use std::path::PathBuf;
use std::process;

use mirrorcache::fs_utils::{create_dir_unless_exists, inspect_cache_directory};
use mirrorcache::mirror_config;
use mirrorcache::{HttpCache, Server};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = match mirror_config::load_config() {
        Ok(config) => config,
        Err(e) => {
            error!("Unable to load the configuration: {}", e);
            process::exit(1);
        }
    };
    debug!("The following settings were fetched from the TOML file or environment variables: {:#?}", &config);
    if config.mirrors.is_empty() {
        warn!("No mirrors are configured: Every request will be answered with 404");
    }

    let cache_directory = PathBuf::from(&config.cache_directory);
    if let Err(e) = create_dir_unless_exists(&cache_directory) {
        error!("Unable to create the cache directory {:?}: {:?}", &cache_directory, e);
        process::exit(1);
    }
    inspect_cache_directory(&cache_directory);

    let server_settings = match config.server_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };
    let cache = HttpCache::new(config.mirrors(), cache_directory, config.upstream_settings());
    match Server::bind(server_settings, cache) {
        Ok(handle) => handle.join(),
        Err(e) => {
            error!("Unable to start the server: {:?}", e);
            process::exit(1);
        }
    }
}
