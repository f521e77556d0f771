//! `contextloop config`: print the default configuration.

use contextloop_config::AppConfig;

pub fn show() {
    println!("# {}", AppConfig::config_dir().join("config.toml").display());
    println!("{}", AppConfig::default_toml());
}

#[cfg(test)]
mod tests {
    use contextloop_config::AppConfig;

    #[test]
    fn default_toml_parses_back() {
        let parsed: AppConfig = toml_roundtrip(&AppConfig::default_toml());
        assert_eq!(parsed.context.max_tokens, AppConfig::default().context.max_tokens);
    }

    fn toml_roundtrip(text: &str) -> AppConfig {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, text).unwrap();
        AppConfig::load_from(&path).unwrap()
    }
}
