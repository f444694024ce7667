//! Human-readable durations for the CLI and API: `90`, `90s`, `10m`, `2h`,
//! `1d`, or concatenations like `1h30m`.

pub fn parse_duration_secs(input: &str) -> Result<i64, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_string());
    }
    if let Ok(plain) = s.parse::<i64>() {
        return if plain >= 0 { Ok(plain) } else { Err(format!("negative duration {:?}", input)) };
    }
    let mut total: i64 = 0;
    let mut value: i64 = 0;
    let mut have_digits = false;
    for c in s.chars() {
        match c {
            '0'..='9' => {
                value = value
                    .checked_mul(10)
                    .and_then(|v| v.checked_add((c as u8 - b'0') as i64))
                    .ok_or_else(|| format!("duration overflow in {:?}", input))?;
                have_digits = true;
            }
            's' | 'm' | 'h' | 'd' => {
                if !have_digits {
                    return Err(format!("unit without value in {:?}", input));
                }
                let unit = match c {
                    's' => 1,
                    'm' => 60,
                    'h' => 3_600,
                    'd' => 86_400,
                    _ => unreachable!(),
                };
                total = value
                    .checked_mul(unit)
                    .and_then(|v| total.checked_add(v))
                    .ok_or_else(|| format!("duration overflow in {:?}", input))?;
                value = 0;
                have_digits = false;
            }
            _ => return Err(format!("unexpected {:?} in duration {:?}", c, input)),
        }
    }
    if have_digits {
        return Err(format!("trailing value without unit in {:?}", input));
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_seconds() {
        assert_eq!(parse_duration_secs("90"), Ok(90));
        assert_eq!(parse_duration_secs("0"), Ok(0));
    }

    #[test]
    fn unit_suffixes() {
        assert_eq!(parse_duration_secs("90s"), Ok(90));
        assert_eq!(parse_duration_secs("10m"), Ok(600));
        assert_eq!(parse_duration_secs("2h"), Ok(7_200));
        assert_eq!(parse_duration_secs("1d"), Ok(86_400));
    }

    #[test]
    fn concatenated_units() {
        assert_eq!(parse_duration_secs("1h30m"), Ok(5_400));
        assert_eq!(parse_duration_secs("1d2h3m4s"), Ok(93_784));
    }

    #[test]
    fn malformed_inputs() {
        assert!(parse_duration_secs("").is_err());
        assert!(parse_duration_secs("m").is_err());
        assert!(parse_duration_secs("10x").is_err());
        assert!(parse_duration_secs("10m5").is_err());
        assert!(parse_duration_secs("-5").is_err());
    }
}
