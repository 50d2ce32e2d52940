use anyhow::ensure;

const MAX_SYMBOL_LEN: usize = 16;

/// Canonical form of a ticker: trimmed and uppercased.
pub fn normalize_symbol(raw: &str) -> anyhow::Result<String> {
    let symbol = raw.trim().to_ascii_uppercase();
    ensure!(!symbol.is_empty(), "symbol must be non-empty");
    ensure!(
        symbol.len() <= MAX_SYMBOL_LEN,
        "symbol too long ({} > {MAX_SYMBOL_LEN}): {symbol}",
        symbol.len()
    );
    ensure!(
        symbol
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '^' | ':' | '=')),
        "symbol contains invalid characters: {symbol}"
    );
    Ok(symbol)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uppercases_and_trims() {
        assert_eq!(normalize_symbol("  aapl ").unwrap(), "AAPL");
        assert_eq!(normalize_symbol("brk.b").unwrap(), "BRK.B");
        assert_eq!(normalize_symbol("^gspc").unwrap(), "^GSPC");
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert!(normalize_symbol("   ").is_err());
        assert!(normalize_symbol("AA PL").is_err());
        assert!(normalize_symbol("AAPL;DROP").is_err());
        assert!(normalize_symbol("ABCDEFGHIJKLMNOPQ").is_err());
    }
}
