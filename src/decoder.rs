use anchor_lang::{AnchorDeserialize, AnchorSerialize};
use anyhow::{Result, bail};

use crate::{
    constants::PRICE_PRECISION,
    types::{
        AccountKind, DecodedAccount, OraclePriceData, OraclePriceFeed, OracleSource, PerpMarket,
        SpotMarket, StateAccount, UserAccount,
    },
};

/// Length of the anchor account discriminator preceding every record
pub const DISCRIMINATOR_LEN: usize = 8;

/// Turns raw account bytes into a typed record.
///
/// Decoding must be deterministic. A failure here is reported separately from a
/// missing account, and the cache keeps whatever it held before.
pub trait AccountDecoder: Send + Sync {
    fn decode(&self, kind: AccountKind, data: &[u8]) -> Result<DecodedAccount>;
}

/// Default decoder for anchor accounts: 8-byte discriminator followed by the borsh body.
///
/// Oracle accounts are read with the `OraclePriceFeed` layout; feeds with a
/// foreign layout need their own `AccountDecoder`.
#[derive(Debug, Default, Clone, Copy)]
pub struct BorshAccountDecoder;

impl AccountDecoder for BorshAccountDecoder {
    fn decode(&self, kind: AccountKind, data: &[u8]) -> Result<DecodedAccount> {
        // quote asset is priced at one unit and has no feed account to read
        if let AccountKind::Oracle(OracleSource::QuoteAsset) = kind {
            return Ok(DecodedAccount::Oracle(quote_asset_price()));
        }

        if data.len() < DISCRIMINATOR_LEN {
            bail!(
                "account data is {} bytes, shorter than the discriminator",
                data.len()
            );
        }
        let body = &mut &data[DISCRIMINATOR_LEN..];

        let decoded = match kind {
            AccountKind::State => DecodedAccount::State(StateAccount::deserialize(body)?),
            AccountKind::PerpMarket => DecodedAccount::PerpMarket(PerpMarket::deserialize(body)?),
            AccountKind::SpotMarket => DecodedAccount::SpotMarket(SpotMarket::deserialize(body)?),
            AccountKind::User => DecodedAccount::User(UserAccount::deserialize(body)?),
            AccountKind::Oracle(source) => {
                let feed = OraclePriceFeed::deserialize(body)?;
                DecodedAccount::Oracle(OraclePriceData::from_feed(feed, source))
            }
        };

        Ok(decoded)
    }
}

fn quote_asset_price() -> OraclePriceData {
    OraclePriceData {
        price: PRICE_PRECISION,
        confidence: 1,
        slot: 0,
        has_sufficient_number_of_data_points: true,
        source: OracleSource::QuoteAsset,
    }
}

/// Encodes a record the way `BorshAccountDecoder` expects to read it
pub fn encode_account<T: AnchorSerialize>(record: &T) -> Result<Vec<u8>> {
    let mut data = vec![0u8; DISCRIMINATOR_LEN];
    record.serialize(&mut data)?;
    Ok(data)
}
