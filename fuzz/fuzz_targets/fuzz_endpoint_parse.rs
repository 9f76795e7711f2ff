#![no_main]

use mysql_broker::config::Endpoint;
use mysql_broker::net::ProxySpec;
use mysql_broker::{CacheKey, Configuration, ServerVersion};
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    let Ok(input) = std::str::from_utf8(data) else {
        return;
    };

    let _ = Endpoint::parse(input);
    let _ = ProxySpec::parse(input);
    let _ = ServerVersion::parse(input);

    let mut config = Configuration::builder(input, "fuzz").build();
    config.proxy = Some(input.to_string());
    let _ = CacheKey::from_config(&config);
    let _ = Configuration::from_json(input);
});
