use anyhow::{
    Context,
    Result,
    anyhow,
};
use bip39::Mnemonic;
use chrono::Utc;
use rand::RngCore;
use serde::{
    Deserialize,
    Serialize,
};
use sha2::{
    Digest,
    Sha256,
};
use std::{
    fmt,
    fs,
    io::Write,
    path::{
        Path,
        PathBuf,
    },
    sync::{
        Arc,
        Mutex,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
};

pub const DEFAULT_SESSION_DIR: &str = "~/.portfolio/session";
const IDENTITY_FILE: &str = "identity.json";
// 128 bits of entropy yields a 12 word phrase
const MNEMONIC_ENTROPY_BYTES: usize = 16;

/// What actually lands in persistent storage. The address is derived on load.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct IdentityRecord {
    pub mnemonic: String,
    pub created_at: String,
}

/// Durable client identity: a BIP-39 phrase plus the address derived from it.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    mnemonic: String,
    address: String,
}

impl Identity {
    pub fn generate() -> Result<Self> {
        let mut entropy = [0u8; MNEMONIC_ENTROPY_BYTES];
        rand::rng().fill_bytes(&mut entropy);
        let mnemonic = Mnemonic::from_entropy(&entropy)
            .map_err(|e| anyhow!("Failed to build mnemonic from entropy: {e}"))?;
        Ok(Self::from_parsed(&mnemonic))
    }

    pub fn from_mnemonic(phrase: &str) -> Result<Self> {
        let mnemonic = Mnemonic::parse(phrase.trim())
            .map_err(|e| anyhow!("Invalid session mnemonic: {e}"))?;
        Ok(Self::from_parsed(&mnemonic))
    }

    fn from_parsed(mnemonic: &Mnemonic) -> Self {
        Self {
            mnemonic: mnemonic.to_string(),
            address: derive_address(mnemonic),
        }
    }

    pub fn mnemonic(&self) -> &str {
        &self.mnemonic
    }

    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("mnemonic", &"<redacted>")
            .field("address", &self.address)
            .finish()
    }
}

pub fn derive_address(mnemonic: &Mnemonic) -> String {
    let seed = mnemonic.to_seed("");
    let digest = Sha256::digest(seed);
    format!("0x{}", hex::encode(digest))
}

pub trait IdentityStorage: Send + Sync {
    /// retrieve the stored identity record, if any
    fn load(&self) -> Result<Option<IdentityRecord>>;

    /// write or overwrite the identity record
    fn save(&self, record: &IdentityRecord) -> Result<()>;

    /// forget the identity record (explicit logout)
    fn clear(&self) -> Result<()>;
}

/// Returns the persisted identity, creating and persisting a fresh one when the
/// storage is empty.
pub fn get_or_create_identity<S: IdentityStorage + ?Sized>(storage: &S) -> Result<Identity> {
    if let Some(record) = storage
        .load()
        .context("Failed to read stored session identity")?
    {
        return Identity::from_mnemonic(&record.mnemonic)
            .context("Stored session identity is not a valid mnemonic");
    }

    let identity = Identity::generate()?;
    let record = IdentityRecord {
        mnemonic: identity.mnemonic().to_string(),
        created_at: Utc::now().to_rfc3339(),
    };
    storage
        .save(&record)
        .context("Failed to persist new session identity")?;
    tracing::info!(address = identity.address(), "created new session identity");
    Ok(identity)
}

pub fn clear_identity<S: IdentityStorage + ?Sized>(storage: &S) -> Result<()> {
    storage
        .clear()
        .context("Failed to clear stored session identity")
}

pub fn resolve_session_dir(dir: Option<&str>) -> PathBuf {
    let raw = dir.unwrap_or(DEFAULT_SESSION_DIR);
    PathBuf::from(shellexpand::tilde(raw).into_owned())
}

#[derive(Debug)]
pub struct FileIdentityStorage {
    path: PathBuf,
}

impl FileIdentityStorage {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let path = ensure_store(dir.as_ref())?;
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityStorage for FileIdentityStorage {
    fn load(&self) -> Result<Option<IdentityRecord>> {
        read_record(&self.path)
    }

    fn save(&self, record: &IdentityRecord) -> Result<()> {
        write_record(&self.path, record)
    }

    fn clear(&self) -> Result<()> {
        fs::write(&self.path, b"").with_context(|| {
            format!("Failed to clear identity record at {}", self.path.display())
        })
    }
}

fn ensure_store(dir: &Path) -> Result<PathBuf> {
    if !dir.exists() {
        fs::create_dir_all(dir).with_context(|| {
            format!("Failed to create session directory {}", dir.display())
        })?;
    }

    let file_path = dir.join(IDENTITY_FILE);
    if !file_path.exists() {
        let mut file = fs::File::create(&file_path).with_context(|| {
            format!("Failed to create identity record file at {:?}", file_path)
        })?;
        file.write_all(b"")
            .context("Failed to initialize identity record file")?;
    }

    Ok(file_path)
}

fn read_record(path: impl AsRef<Path>) -> Result<Option<IdentityRecord>> {
    let data = fs::read(path.as_ref()).context("Failed to read identity record")?;
    if data.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    let record = serde_json::from_slice::<IdentityRecord>(&data)
        .context("Failed to parse identity record JSON")?;
    Ok(Some(record))
}

fn write_record(path: impl AsRef<Path>, record: &IdentityRecord) -> Result<()> {
    let json =
        serde_json::to_vec_pretty(record).context("Failed to serialize identity record")?;
    fs::write(path.as_ref(), json).context("Failed to write identity record")?;
    Ok(())
}

/// Process-local storage. Clones share the same slot.
#[derive(Clone, Default)]
pub struct InMemoryIdentityStorage {
    record: Arc<Mutex<Option<IdentityRecord>>>,
    unavailable: Arc<AtomicBool>,
}

impl InMemoryIdentityStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_with_record(record: IdentityRecord) -> Self {
        Self {
            record: Arc::new(Mutex::new(Some(record))),
            unavailable: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn record(&self) -> Arc<Mutex<Option<IdentityRecord>>> {
        self.record.clone()
    }

    /// Makes every subsequent call fail, like a browser with storage disabled.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(anyhow!("identity storage is unavailable"));
        }
        Ok(())
    }
}

impl IdentityStorage for InMemoryIdentityStorage {
    fn load(&self) -> Result<Option<IdentityRecord>> {
        self.ensure_available()?;
        let guard = self
            .record
            .lock()
            .map_err(|_| anyhow!("identity storage lock poisoned"))?;
        Ok(guard.clone())
    }

    fn save(&self, record: &IdentityRecord) -> Result<()> {
        self.ensure_available()?;
        let mut guard = self
            .record
            .lock()
            .map_err(|_| anyhow!("identity storage lock poisoned"))?;
        *guard = Some(record.clone());
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        self.ensure_available()?;
        let mut guard = self
            .record
            .lock()
            .map_err(|_| anyhow!("identity storage lock poisoned"))?;
        *guard = None;
        Ok(())
    }
}
