//! Human ticket codes: `XXX-XXX-XX` drawn from an alphabet without look-alike
//! characters (no `I`, `O`, `0`, `1`).

use rand::Rng;
use tracing::warn;

use crate::database::error::DatabaseError;
use crate::database::TicketStore;

pub const CODE_ALPHABET: &[u8; 32] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";
pub const CODE_SYMBOLS: usize = 8;
pub const MAX_CODE_ATTEMPTS: usize = 5;

/// Draw one random code. Uniqueness is not checked here.
pub fn random_code<R: Rng + ?Sized>(rng: &mut R) -> String {
    let raw: Vec<char> = (0..CODE_SYMBOLS)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect();

    let mut code = String::with_capacity(CODE_SYMBOLS + 2);
    for (i, c) in raw.into_iter().enumerate() {
        if i == 3 || i == 6 {
            code.push('-');
        }
        code.push(c);
    }
    code
}

pub fn is_well_formed(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == CODE_SYMBOLS + 2
        && bytes.iter().enumerate().all(|(i, b)| match i {
            3 | 7 => *b == b'-',
            _ => CODE_ALPHABET.contains(b),
        })
}

/// Draw codes until one is not used by any ticket.
///
/// Returns `Ok(None)` once [`MAX_CODE_ATTEMPTS`] draws all collided.
pub async fn generate_unique_code(store: &dyn TicketStore) -> Result<Option<String>, DatabaseError> {
    for attempt in 1..=MAX_CODE_ATTEMPTS {
        let code = random_code(&mut rand::thread_rng());
        if !store.code_exists(&code).await? {
            return Ok(Some(code));
        }
        warn!(attempt, "ticket code collision, drawing again");
    }

    Ok(None)
}
