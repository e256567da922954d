use chrono::Utc;
use log::warn;

const ADJECTIVES: &[&str] = &[
    "brave", "calm", "clever", "eager", "fancy", "gentle", "happy", "jolly", "keen", "lively",
    "lucky", "mighty", "nimble", "proud", "quiet", "rapid", "shiny", "silly", "swift", "witty",
    "bold", "bright", "cosmic", "daring", "fuzzy", "golden", "humble", "misty", "noble", "sunny",
];

const ANIMALS: &[&str] = &[
    "otter", "panda", "falcon", "badger", "beaver", "bison", "cobra", "dingo", "eagle", "ferret",
    "gecko", "heron", "ibis", "jaguar", "koala", "lemur", "lynx", "marten", "newt", "ocelot",
    "puffin", "quokka", "raven", "salmon", "tapir", "urchin", "walrus", "yak", "zebra", "wombat",
];

fn random_index(len: usize) -> usize {
    let mut bytes = [0u8; 4];
    if let Err(e) = getrandom::fill(&mut bytes) {
        warn!("Failed to get random bytes, using fallback: {e}");
        let nanos = Utc::now().timestamp_subsec_nanos();
        bytes = nanos.to_le_bytes();
    }
    u32::from_le_bytes(bytes) as usize % len
}

/// `<adjective>-<animal>` not rejected by `is_taken`, trying `attempts`
/// random picks before falling back to a timestamp-suffixed name.
pub fn generate_session_name(is_taken: impl Fn(&str) -> bool, attempts: u32) -> String {
    generate_with(is_taken, attempts, random_index)
}

pub fn generate_with(
    is_taken: impl Fn(&str) -> bool,
    attempts: u32,
    mut pick: impl FnMut(usize) -> usize,
) -> String {
    let mut last = String::new();
    for _ in 0..attempts.max(1) {
        let adjective = ADJECTIVES[pick(ADJECTIVES.len()) % ADJECTIVES.len()];
        let animal = ANIMALS[pick(ANIMALS.len()) % ANIMALS.len()];
        let candidate = format!("{adjective}-{animal}");
        if !is_taken(&candidate) {
            return candidate;
        }
        last = candidate;
    }
    let stamped = format!("{last}-{}", Utc::now().timestamp_millis());
    let mut fallback = stamped.clone();
    let mut counter = 1;
    while is_taken(&fallback) {
        counter += 1;
        fallback = format!("{stamped}-{counter}");
    }
    warn!("Name generation exhausted {attempts} attempts, using '{fallback}'");
    fallback
}

/// Lowercase letters, digits and single hyphens; usable as a branch and
/// directory component.
pub fn is_valid_session_name(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 64
        && !name.starts_with('-')
        && !name.ends_with('-')
        && !name.contains("--")
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}
