//! Text form of selection expressions.

use crate::error::{Error, Result};

use super::{Selection, SelectionOptions};

impl SelectionOptions {
    /// Parses the space-separated expression text and validates it.
    ///
    /// The grammar is tabulated in the [module docs](super). Parsing is
    /// token-at-a-time: `and`/`or` become connectives, `TAG@rest` becomes
    /// the tagged term, anything else is a comma-separated host list.
    ///
    /// # Errors
    ///
    /// Returns `bad-request` for unknown tags, malformed key:value terms,
    /// or any structural/pattern violation caught by
    /// [`validate`](SelectionOptions::validate).
    pub fn parse(text: &str) -> Result<Self> {
        let mut selections = Vec::new();
        for token in text.split_whitespace() {
            selections.push(parse_token(token)?);
        }

        let options = Self { selections };
        options.validate()?;
        Ok(options)
    }
}

fn parse_token(token: &str) -> Result<Selection> {
    match token {
        "and" => return Ok(Selection::And),
        "or" => return Ok(Selection::Or),
        _ => {}
    }

    let Some((tag, rest)) = token.split_once('@') else {
        // Bare host list. "*" is kept as a single wildcard entry.
        let hosts = token.split(',').map(str::to_string).collect();
        return Ok(Selection::Hosts(hosts));
    };

    match tag {
        "E" => Ok(Selection::HostRegex(rest.to_string())),
        "R" => Ok(Selection::IdRange(rest.to_string())),
        "N" => Ok(Selection::Groups(
            rest.split(',').map(str::to_string).collect(),
        )),
        "S" => Ok(Selection::IpCidr(rest.to_string())),
        "G" | "P" | "I" | "J" => {
            let (key, value) = rest.split_once(':').ok_or_else(|| {
                Error::bad_request(format!("'{token}' is missing a key:value separator"))
            })?;
            if key.is_empty() {
                return Err(Error::bad_request(format!("'{token}' has an empty key")));
            }
            let key = key.to_string();
            let value = value.to_string();
            Ok(match tag {
                "G" => Selection::Grain { key, value },
                "P" => Selection::GrainRegex { key, pattern: value },
                "I" => Selection::Pillar { key, value },
                _ => Selection::PillarRegex { key, pattern: value },
            })
        }
        other => Err(Error::bad_request(format!("unknown selection tag '{other}@'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_every_term_kind() {
        let text = "m1,m2 and E@web[0-9]+ or R@%-prod and N@web,api \
                    or S@10.0.0.0/8 and G@os:linux or P@os:ubuntu.* \
                    and I@role:db or J@role:web.*";
        let opts = SelectionOptions::parse(text).unwrap();
        assert_eq!(opts.selections.len(), 17);
        assert_eq!(opts.to_text(), text.split_whitespace().collect::<Vec<_>>().join(" "));
    }

    #[test]
    fn wildcard_parses_as_single_host() {
        let opts = SelectionOptions::parse("*").unwrap();
        assert_eq!(
            opts.selections,
            vec![Selection::Hosts(vec!["*".to_string()])]
        );
    }

    #[test]
    fn round_trip_is_stable() {
        for text in [
            "*",
            "m1",
            "m1,m2,m3",
            "E@^db-[a-z]+$",
            "G@os:linux and G@role:web",
            "N@web or S@192.168.0.0/16 and I@env:prod",
            "R@web% or R@%-prod",
        ] {
            let parsed = SelectionOptions::parse(text).unwrap();
            let rendered = parsed.to_text();
            assert_eq!(rendered, text);
            assert_eq!(SelectionOptions::parse(&rendered).unwrap().to_text(), rendered);
        }
    }

    #[test]
    fn value_may_contain_colons() {
        let opts = SelectionOptions::parse("G@listen:127.0.0.1:8080").unwrap();
        assert_eq!(
            opts.selections,
            vec![Selection::Grain {
                key: "listen".to_string(),
                value: "127.0.0.1:8080".to_string(),
            }]
        );
    }

    #[test]
    fn rejects_garbage() {
        assert!(SelectionOptions::parse("").is_err());
        assert!(SelectionOptions::parse("and m1").is_err());
        assert!(SelectionOptions::parse("m1 and and m2").is_err());
        assert!(SelectionOptions::parse("X@whatever").is_err());
        assert!(SelectionOptions::parse("G@oslinux").is_err());
        assert!(SelectionOptions::parse("E@[").is_err());
        assert!(SelectionOptions::parse("S@not-a-cidr").is_err());
    }
}
