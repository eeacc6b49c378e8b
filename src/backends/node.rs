//! Pool entries and weighted node state

use super::BalanceError;

/// Split a membership entry of the form `address[,weight]` into its parts
pub fn split_entry(entry: &str) -> Vec<&str> {
    entry
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect()
}

/// A backend in a weighted pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightNode {
    pub addr: String,
    /// Nominal weight from configuration
    pub weight: i64,
    /// Usable weight; lowered by failures, recovers by one per selection round
    pub effective_weight: i64,
    /// Selection accumulator
    pub current_weight: i64,
}

impl WeightNode {
    pub fn new(addr: impl Into<String>, weight: i64) -> Self {
        Self {
            addr: addr.into(),
            weight,
            effective_weight: weight,
            current_weight: 0,
        }
    }

    /// Build a node from `[address, weight]` parameters
    pub fn from_params(params: &[&str]) -> Result<Self, BalanceError> {
        let [addr, weight] = params else {
            return Err(BalanceError::InvalidParameters(format!(
                "weighted backend needs exactly 2 params (address, weight), got {}",
                params.len()
            )));
        };
        if addr.is_empty() {
            return Err(BalanceError::InvalidParameters("empty backend address".to_string()));
        }
        let weight: i64 = weight
            .parse()
            .map_err(|_| BalanceError::InvalidWeight(weight.to_string()))?;
        Ok(Self::new(*addr, weight))
    }
}

/// Extract the address from single-address parameters, ignoring any trailing weight
pub(crate) fn address_param<'a>(params: &[&'a str]) -> Result<&'a str, BalanceError> {
    match params.first() {
        Some(addr) if !addr.is_empty() => Ok(*addr),
        Some(_) => Err(BalanceError::InvalidParameters("empty backend address".to_string())),
        None => Err(BalanceError::InvalidParameters("params len 0, need an address".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_entry() {
        assert_eq!(split_entry("127.0.0.1:2003"), vec!["127.0.0.1:2003"]);
        assert_eq!(split_entry("127.0.0.1:2003,50"), vec!["127.0.0.1:2003", "50"]);
        assert_eq!(split_entry(" 127.0.0.1:2003 , 50 "), vec!["127.0.0.1:2003", "50"]);
        assert!(split_entry("").is_empty());
    }

    #[test]
    fn test_weight_node_from_params() {
        let node = WeightNode::from_params(&["127.0.0.1:2003", "4"]).unwrap();
        assert_eq!(node.addr, "127.0.0.1:2003");
        assert_eq!(node.weight, 4);
        assert_eq!(node.effective_weight, 4);
        assert_eq!(node.current_weight, 0);
    }

    #[test]
    fn test_weight_node_bad_params() {
        assert!(matches!(
            WeightNode::from_params(&["127.0.0.1:2003"]),
            Err(BalanceError::InvalidParameters(_))
        ));
        assert!(matches!(
            WeightNode::from_params(&["127.0.0.1:2003", "1", "2"]),
            Err(BalanceError::InvalidParameters(_))
        ));
        assert_eq!(
            WeightNode::from_params(&["127.0.0.1:2003", "heavy"]),
            Err(BalanceError::InvalidWeight("heavy".to_string()))
        );
    }

    #[test]
    fn test_address_param() {
        assert_eq!(address_param(&["a:1", "20"]).unwrap(), "a:1");
        assert!(address_param(&[]).is_err());
        assert!(address_param(&[""]).is_err());
    }
}
