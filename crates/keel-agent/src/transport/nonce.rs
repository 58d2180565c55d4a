use rand::Rng;

const NONCE_LEN: usize = 12;
const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Random alphanumeric nonce embedded in wrapper tag names for one
/// turn-build. Quoted examples in the model's own text cannot guess it, so
/// only tags carrying the live nonce are treated as directives.
pub fn generate_nonce() -> String {
    let mut rng = rand::rng();
    (0..NONCE_LEN)
        .map(|_| ALPHABET[rng.random_range(0..ALPHABET.len())] as char)
        .collect()
}
