use crate::basic::value::Value;
use rand::Rng;

/// Dispatch a builtin function by (uppercased) name. Arguments arrive in
/// call order. Errors are plain strings; the VM wraps them with context.
pub fn call_builtin<R: Rng>(name: &str, args: &[Value], rng: &mut R) -> Result<Value, String> {
    match name {
        "ABS" => num1(name, args).map(|x| Value::Num(x.abs())),
        "INT" => num1(name, args).map(|x| Value::Num(x.floor())),
        "FLOOR" => num1(name, args).map(|x| Value::Num(x.floor())),
        "CEIL" => num1(name, args).map(|x| Value::Num(x.ceil())),
        "ROUND" => num1(name, args).map(|x| Value::Num(x.round())),
        "SIN" => num1(name, args).map(|x| Value::Num(x.sin())),
        "COS" => num1(name, args).map(|x| Value::Num(x.cos())),
        "TAN" => num1(name, args).map(|x| Value::Num(x.tan())),
        "ASIN" => {
            let x = num1(name, args)?;
            if !(-1.0..=1.0).contains(&x) {
                return Err(format!("ASIN argument {x} outside [-1,1]"));
            }
            Ok(Value::Num(x.asin()))
        }
        "ACOS" => {
            let x = num1(name, args)?;
            if !(-1.0..=1.0).contains(&x) {
                return Err(format!("ACOS argument {x} outside [-1,1]"));
            }
            Ok(Value::Num(x.acos()))
        }
        "ATAN" => num1(name, args).map(|x| Value::Num(x.atan())),
        "LOG" => {
            let x = num1(name, args)?;
            if x <= 0.0 {
                return Err(format!("LOG of non-positive value {x}"));
            }
            Ok(Value::Num(x.ln()))
        }
        "LOG10" => {
            let x = num1(name, args)?;
            if x <= 0.0 {
                return Err(format!("LOG10 of non-positive value {x}"));
            }
            Ok(Value::Num(x.log10()))
        }
        "EXP" => num1(name, args).map(|x| Value::Num(x.exp())),
        "SQR" | "SQRT" => {
            let x = num1(name, args)?;
            if x < 0.0 {
                return Err(format!("{name} of negative value {x}"));
            }
            Ok(Value::Num(x.sqrt()))
        }
        "PI" => {
            arity(name, args, 0)?;
            Ok(Value::Num(std::f64::consts::PI))
        }
        "E" => {
            arity(name, args, 0)?;
            Ok(Value::Num(std::f64::consts::E))
        }
        "POW" => {
            arity(name, args, 2)?;
            let a = num_at(name, args, 0)?;
            let b = num_at(name, args, 1)?;
            Ok(Value::Num(a.powf(b)))
        }
        "MIN" => {
            arity(name, args, 2)?;
            Ok(Value::Num(num_at(name, args, 0)?.min(num_at(name, args, 1)?)))
        }
        "MAX" => {
            arity(name, args, 2)?;
            Ok(Value::Num(num_at(name, args, 0)?.max(num_at(name, args, 1)?)))
        }
        // RND() and RND(1) return a float in [0,1); RND(n) for n >= 2 rolls
        // an integer in [1, n]
        "RND" => {
            if args.len() > 1 {
                return Err("RND takes at most one argument".into());
            }
            let n = if args.is_empty() { 1.0 } else { num_at(name, args, 0)? };
            if n >= 2.0 {
                Ok(Value::Num(rng.random_range(1..=n.floor() as i64) as f64))
            } else {
                Ok(Value::Num(rng.random::<f64>()))
            }
        }
        "LEN" => {
            arity(name, args, 1)?;
            Ok(Value::Num(args[0].coerce_str().chars().count() as f64))
        }
        "MID$" => {
            if args.len() != 2 && args.len() != 3 {
                return Err("MID$ takes 2 or 3 arguments".into());
            }
            let s = args[0].coerce_str();
            let start = num_at(name, args, 1)?;
            if start < 1.0 {
                return Err("MID$ start position must be >= 1".into());
            }
            let start = start as usize - 1;
            let len = if args.len() == 3 {
                num_at(name, args, 2)?.max(0.0) as usize
            } else {
                usize::MAX
            };
            Ok(Value::Str(s.chars().skip(start).take(len).collect()))
        }
        "LEFT$" => {
            arity(name, args, 2)?;
            let s = args[0].coerce_str();
            let n = num_at(name, args, 1)?.max(0.0) as usize;
            Ok(Value::Str(s.chars().take(n).collect()))
        }
        "RIGHT$" => {
            arity(name, args, 2)?;
            let s = args[0].coerce_str();
            let n = num_at(name, args, 1)?.max(0.0) as usize;
            let chars: Vec<char> = s.chars().collect();
            let skip = chars.len().saturating_sub(n);
            Ok(Value::Str(chars[skip..].iter().collect()))
        }
        _ => Err(format!("unknown function {name}")),
    }
}

pub fn is_builtin(name: &str) -> bool {
    matches!(
        name,
        "ABS" | "INT" | "RND" | "LEN" | "MID$" | "LEFT$" | "RIGHT$" | "SIN" | "COS" | "TAN"
            | "ASIN" | "ACOS" | "ATAN" | "LOG" | "LOG10" | "EXP" | "SQR" | "SQRT" | "PI" | "E"
            | "FLOOR" | "CEIL" | "ROUND" | "POW" | "MIN" | "MAX"
    )
}

fn arity(name: &str, args: &[Value], want: usize) -> Result<(), String> {
    if args.len() != want {
        return Err(format!("{name} takes {want} argument(s), got {}", args.len()));
    }
    Ok(())
}

fn num_at(name: &str, args: &[Value], idx: usize) -> Result<f64, String> {
    args[idx]
        .as_num()
        .ok_or_else(|| format!("{name} argument {} must be numeric", idx + 1))
}

fn num1(name: &str, args: &[Value]) -> Result<f64, String> {
    arity(name, args, 1)?;
    num_at(name, args, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn rng() -> StdRng {
        StdRng::seed_from_u64(7)
    }

    #[test]
    fn string_functions() {
        let r = &mut rng();
        assert_eq!(
            call_builtin("MID$", &[Value::Str("HELLO".into()), Value::Num(2.0), Value::Num(3.0)], r).unwrap(),
            Value::Str("ELL".into())
        );
        assert_eq!(
            call_builtin("LEFT$", &[Value::Str("HELLO".into()), Value::Num(2.0)], r).unwrap(),
            Value::Str("HE".into())
        );
        assert_eq!(
            call_builtin("RIGHT$", &[Value::Str("HELLO".into()), Value::Num(2.0)], r).unwrap(),
            Value::Str("LO".into())
        );
        assert_eq!(
            call_builtin("LEN", &[Value::Str("HELLO".into())], r).unwrap(),
            Value::Num(5.0)
        );
    }

    #[test]
    fn domain_errors_are_named() {
        let r = &mut rng();
        assert!(call_builtin("LOG", &[Value::Num(0.0)], r).unwrap_err().contains("LOG"));
        assert!(call_builtin("SQR", &[Value::Num(-1.0)], r).unwrap_err().contains("SQR"));
        assert!(call_builtin("ASIN", &[Value::Num(2.0)], r).unwrap_err().contains("ASIN"));
    }

    #[test]
    fn rnd_ranges() {
        let r = &mut rng();
        for _ in 0..50 {
            let Value::Num(x) = call_builtin("RND", &[], r).unwrap() else { panic!() };
            assert!((0.0..1.0).contains(&x));
            let Value::Num(d) = call_builtin("RND", &[Value::Num(6.0)], r).unwrap() else { panic!() };
            assert!((1.0..=6.0).contains(&d));
            assert_eq!(d.fract(), 0.0);
        }
    }

    #[test]
    fn arity_is_checked() {
        let r = &mut rng();
        assert!(call_builtin("ABS", &[], r).is_err());
        assert!(call_builtin("MIN", &[Value::Num(1.0)], r).is_err());
        assert!(call_builtin("PI", &[Value::Num(1.0)], r).is_err());
    }
}
