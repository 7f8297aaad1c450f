use std::{fmt, io, path::PathBuf, str::FromStr};

use miniscript::bitcoin::{self, address, bip32, Network};

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

fn deserialize_fromstr<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: FromStr,
    <T as FromStr>::Err: std::fmt::Display,
{
    let string = String::deserialize(deserializer)?;
    T::from_str(&string)
        .map_err(|e| de::Error::custom(format!("Error parsing '{}': {}", string, e)))
}

pub fn serialize_to_string<T: std::fmt::Display, S: Serializer>(
    field: T,
    s: S,
) -> Result<S::Ok, S::Error> {
    s.serialize_str(&field.to_string())
}

fn deserialize_amount_from_sats<'de, D>(deserializer: D) -> Result<bitcoin::Amount, D::Error>
where
    D: Deserializer<'de>,
{
    let sats = u64::deserialize(deserializer)?;
    Ok(bitcoin::Amount::from_sat(sats))
}

fn serialize_amount_as_sats<S: Serializer>(
    amount: &bitcoin::Amount,
    s: S,
) -> Result<S::Ok, S::Error> {
    s.serialize_u64(amount.to_sat())
}

fn serialize_hex<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&hex::encode(bytes))
}

fn deserialize_key_material<'de, D>(deserializer: D) -> Result<KeyMaterial, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    pub struct KeyMaterialHelper {
        seed: Option<String>,
        mnemonic: Option<String>,
    }
    let KeyMaterialHelper { seed, mnemonic } = KeyMaterialHelper::deserialize(deserializer)?;
    let key_material = match (seed, mnemonic) {
        (Some(_), Some(_)) => {
            return Err(de::Error::custom("must not set both `seed` and `mnemonic`"));
        }
        (Some(seed), None) => {
            let bytes = hex::decode(&seed)
                .map_err(|e| de::Error::custom(format!("`seed` must be hex: {}", e)))?;
            if bytes.len() < 16 || bytes.len() > 64 {
                return Err(de::Error::custom("`seed` must be 16 to 64 bytes"));
            }
            KeyMaterial::Seed(bytes)
        }
        (None, Some(mnemonic)) => KeyMaterial::Mnemonic(mnemonic),
        (None, None) => {
            return Err(de::Error::custom("must set either `seed` or `mnemonic`"));
        }
    };
    Ok(key_material)
}

fn default_loglevel() -> log::LevelFilter {
    log::LevelFilter::Info
}

/// Key material options for the locally-held co-signer.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub enum KeyMaterial {
    /// Raw BIP32 seed, hex-encoded in the configuration file.
    #[serde(rename = "seed", serialize_with = "serialize_hex")]
    Seed(Vec<u8>),
    /// BIP39 mnemonic words.
    #[serde(rename = "mnemonic")]
    Mnemonic(String),
}

impl fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "REDACTED KEY MATERIAL")
    }
}

impl Default for KeyMaterial {
    fn default() -> Self {
        // The demonstration seed of the original tool. Never hold real funds with it.
        Self::Seed(vec![0xab; 32])
    }
}

/// The locally-held co-signer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct LocalSignerConfig {
    #[serde(flatten, deserialize_with = "deserialize_key_material")]
    pub key_material: KeyMaterial,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct BitcoinConfig {
    /// The network we are operating on, one of "bitcoin", "testnet", "regtest", "signet"
    pub network: Network,
}

impl Default for BitcoinConfig {
    fn default() -> Self {
        Self {
            network: Network::Testnet,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct ExplorerConfig {
    /// Base URL of the Esplora HTTP API to query coins from and broadcast through.
    pub base_url: String,
}

impl Default for ExplorerConfig {
    fn default() -> Self {
        Self {
            base_url: "https://mempool.space/testnet/api".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct WalletConfig {
    /// Name under which the policy is registered on the signing device.
    #[serde(default = "default_wallet_name")]
    pub name: String,
    /// Hardened path from the master to the account both co-signers use.
    #[serde(
        deserialize_with = "deserialize_fromstr",
        serialize_with = "serialize_to_string",
        default = "default_account_path"
    )]
    pub account_path: bip32::DerivationPath,
    /// Where the spent coin's value goes, minus the fee.
    pub recipient: bitcoin::Address<address::NetworkUnchecked>,
    /// The absolute fee paid by the spend transaction, in satoshis.
    #[serde(
        deserialize_with = "deserialize_amount_from_sats",
        serialize_with = "serialize_amount_as_sats",
        default = "default_fee"
    )]
    pub fee: bitcoin::Amount,
}

fn default_wallet_name() -> String {
    "duosig".to_string()
}

fn default_account_path() -> bip32::DerivationPath {
    bip32::DerivationPath::from_str("m/84'/1'/0'").expect("valid derivation path")
}

fn default_fee() -> bitcoin::Amount {
    bitcoin::Amount::from_sat(500)
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            name: default_wallet_name(),
            account_path: default_account_path(),
            recipient: bitcoin::Address::from_str("2MvD5Ug9arybH1K4rJNDwiNaSCw9cPxfyZn")
                .expect("valid address"),
            fee: default_fee(),
        }
    }
}

/// Static information we require to operate
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Config {
    /// What messages to log
    #[serde(
        deserialize_with = "deserialize_fromstr",
        serialize_with = "serialize_to_string",
        default = "default_loglevel"
    )]
    pub log_level: log::LevelFilter,
    /// Everything related to the chain we spend on
    #[serde(default)]
    pub bitcoin_config: BitcoinConfig,
    /// Everything we need to know to talk to the block explorer
    #[serde(default)]
    pub explorer_config: ExplorerConfig,
    /// The wallet we spend from
    #[serde(default)]
    pub wallet_config: WalletConfig,
    /// The locally-held co-signer key
    #[serde(default)]
    pub local_signer: LocalSignerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_loglevel(),
            bitcoin_config: BitcoinConfig::default(),
            explorer_config: ExplorerConfig::default(),
            wallet_config: WalletConfig::default(),
            local_signer: LocalSignerConfig::default(),
        }
    }
}

#[derive(PartialEq, Eq, Debug)]
pub enum ConfigError {
    DatadirNotFound,
    FileNotFound,
    ReadingFile(String),
    Unexpected(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::DatadirNotFound => write!(f, "Could not locate the configuration directory."),
            Self::FileNotFound => write!(f, "Could not locate the configuration file."),
            Self::ReadingFile(e) => write!(f, "Failed to read configuration file: {}", e),
            Self::Unexpected(e) => write!(f, "Configuration error: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<io::Error> for ConfigError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::NotFound => Self::FileNotFound,
            _ => Self::ReadingFile(e.to_string()),
        }
    }
}

/// Get the absolute path to the duosig configuration folder.
///
/// It's a "duosig/" directory in the XDG standard configuration directory for all OSes
/// but Linux-based ones, for which it's a ".duosig/" directory in the home directory.
pub fn config_folder_path() -> Option<PathBuf> {
    #[cfg(target_os = "linux")]
    let configs_dir = dirs::home_dir();

    #[cfg(not(target_os = "linux"))]
    let configs_dir = dirs::config_dir();

    if let Some(mut path) = configs_dir {
        #[cfg(target_os = "linux")]
        path.push(".duosig");

        #[cfg(not(target_os = "linux"))]
        path.push("Duosig");

        return Some(path);
    }

    None
}

fn config_file_path() -> Option<PathBuf> {
    config_folder_path().map(|mut path| {
        path.push("duosig.toml");
        path
    })
}

impl Config {
    /// Get our static configuration out of a configuration file.
    ///
    /// We require all settings to be set in the configuration file, and only in the
    /// configuration file. We don't allow to set them via the command line or
    /// environment variables. With no file at the default location, the built-in
    /// demonstration settings apply.
    pub fn from_file(custom_path: Option<PathBuf>) -> Result<Config, ConfigError> {
        let (config_file, is_default_path) = match custom_path {
            Some(path) => (path, false),
            None => (
                config_file_path().ok_or(ConfigError::DatadirNotFound)?,
                true,
            ),
        };

        let contents = match std::fs::read(&config_file) {
            Ok(contents) => contents,
            Err(e) if is_default_path && e.kind() == io::ErrorKind::NotFound => {
                let config = Config::default();
                config.check()?;
                return Ok(config);
            }
            Err(e) => return Err(e.into()),
        };
        let config = toml::from_slice::<Config>(&contents)
            .map_err(|e| ConfigError::ReadingFile(format!("Parsing configuration file: {}", e)))?;
        config.check()?;

        Ok(config)
    }

    /// Sanity check the configuration.
    pub fn check(&self) -> Result<(), ConfigError> {
        if self.wallet_config.account_path.is_empty()
            || !self
                .wallet_config
                .account_path
                .into_iter()
                .all(|child| child.is_hardened())
        {
            return Err(ConfigError::Unexpected(
                "the account derivation path must be non-empty and hardened".to_string(),
            ));
        }
        if self.wallet_config.fee == bitcoin::Amount::ZERO {
            return Err(ConfigError::Unexpected(
                "the transaction fee must not be null".to_string(),
            ));
        }
        if self.explorer_config.base_url.is_empty() {
            return Err(ConfigError::Unexpected(
                "the explorer base URL must be set".to_string(),
            ));
        }
        Ok(())
    }
}
