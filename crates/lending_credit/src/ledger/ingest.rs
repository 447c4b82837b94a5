//! Observation ingest: gate check, delta, USD normalization, mutation.

use super::state::{BalanceKey, ClaimKey, GateKey, Movement, UserBook};
use super::{GateScope, Ledger, LedgerError};
use crate::chain::{PriceError, PriceNormalizer};
use crate::protocol::{Facet, Observation, Protocol};
use crate::types::{Address, U256};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::Ordering;
use tracing::{debug, info, warn};

/// Private working copy of one user's book for the duration of an ingest.
struct Txn {
    book: UserBook,
    /// Gates advanced during this call; same-block siblings may still pass.
    advanced: HashSet<(Protocol, Facet)>,
    /// Balances already applied at a block in this call.
    seen: HashSet<(BalanceKey, u64)>,
    /// Global high-water updates, published with the book.
    high_water: HashMap<(Protocol, Facet), u64>,
    applied: usize,
    skipped: usize,
}

impl Txn {
    fn new(book: UserBook) -> Self {
        Self {
            book,
            advanced: HashSet::new(),
            seen: HashSet::new(),
            high_water: HashMap::new(),
            applied: 0,
            skipped: 0,
        }
    }
}

impl Ledger {
    /// Decode `payload` for `protocol_tag` and apply it to `user`'s records.
    ///
    /// Fatal (nothing applied): untrusted `caller`, unknown tag, undecodable
    /// payload, failed USD conversion. Records rejected by the registry or
    /// the facet gate are skipped.
    pub async fn ingest(
        &self,
        caller: &Address,
        user: Address,
        protocol_tag: &str,
        payload: &[u8],
    ) -> Result<(), LedgerError> {
        self.authorize(caller)?;
        let protocol: Protocol = protocol_tag.parse()?;
        let observations = protocol.decode(user, payload, self.registry.as_ref())?;
        self.apply_batch(user, protocol, observations).await
    }

    /// Apply already-decoded observations. Observations for another user or
    /// protocol are skipped.
    pub async fn ingest_observations(
        &self,
        caller: &Address,
        user: Address,
        protocol: Protocol,
        observations: Vec<Observation>,
    ) -> Result<(), LedgerError> {
        self.authorize(caller)?;
        self.apply_batch(user, protocol, observations).await
    }

    async fn apply_batch(
        &self,
        user: Address,
        protocol: Protocol,
        observations: Vec<Observation>,
    ) -> Result<(), LedgerError> {
        // Lock order: protocol (global scope only), then user.
        let _protocol_guard = match self.config.gate_scope {
            GateScope::Global => Some(self.protocol_locks[protocol.index()].lock().await),
            GateScope::PerUser => None,
        };
        let slot = self.slot(user);
        let _writer = slot.writer.lock().await;
        let normalizer = self.normalizer.read().clone();

        let mut txn = Txn::new((*slot.snapshot()).clone());
        for obs in observations {
            if obs.user != user || obs.protocol != protocol {
                warn!(
                    %user,
                    %protocol,
                    obs_user = %obs.user,
                    obs_protocol = %obs.protocol,
                    "observation for another key skipped"
                );
                txn.skipped += 1;
                continue;
            }
            self.apply_one(&mut txn, normalizer.as_ref(), obs).await?;
        }

        let Txn {
            book,
            high_water,
            applied,
            skipped,
            ..
        } = txn;
        slot.publish(book);
        for ((p, f), block) in high_water {
            self.high_water[p.index()][f.index()].fetch_max(block, Ordering::AcqRel);
        }
        info!(%user, %protocol, applied, skipped, "ingest committed");
        Ok(())
    }

    fn gate_for(&self, txn: &Txn, protocol: Protocol, facet: Facet) -> u64 {
        match self.config.gate_scope {
            GateScope::PerUser => txn.book.gate(protocol, facet),
            GateScope::Global => txn
                .high_water
                .get(&(protocol, facet))
                .copied()
                .unwrap_or_else(|| {
                    self.high_water[protocol.index()][facet.index()].load(Ordering::Acquire)
                }),
        }
    }

    async fn apply_one(
        &self,
        txn: &mut Txn,
        normalizer: &dyn PriceNormalizer,
        obs: Observation,
    ) -> Result<(), LedgerError> {
        let (protocol, facet, block) = (obs.protocol, obs.facet, obs.block);

        let balance_key = BalanceKey {
            protocol,
            token_id: obs.token_id,
            facet,
        };
        let gate = self.gate_for(txn, protocol, facet);
        // Equal-block observations pass only for other balances of this call.
        let sibling = block == gate
            && txn.advanced.contains(&(protocol, facet))
            && !txn.seen.contains(&(balance_key, block));
        if block < gate || (block == gate && !sibling) {
            debug!(%protocol, ?facet, block, gate, "superseded observation skipped");
            txn.skipped += 1;
            return Ok(());
        }
        let stored = txn
            .book
            .balances
            .get(&balance_key)
            .copied()
            .unwrap_or_default();
        let (movement, raw_delta) = Movement::classify(facet, stored, obs.raw_value);
        let counted = movement.is_counted() && !raw_delta.is_zero();

        let usd = if counted {
            let assets = match obs.share_basis {
                Some(basis) => basis
                    .to_assets(raw_delta)
                    .ok_or(LedgerError::ShareOverflow(obs.token_id))?,
                None => raw_delta,
            };
            self.to_usd(normalizer, obs.underlying_asset, assets).await?
        } else {
            U256::zero()
        };

        let record = txn.book.protocols.entry(protocol).or_default();
        if counted {
            record.record_movement(movement, usd);
        }
        record.touch(block, obs.raw_value);
        if record.first_activity_block == 0 {
            record.first_activity_block = block;
        }
        let first = record.first_activity_block;

        let totals = &mut txn.book.totals;
        if counted {
            totals.record_movement(movement, usd);
        }
        totals.touch(block, obs.raw_value);
        if totals.first_activity_block == 0 || first < totals.first_activity_block {
            totals.first_activity_block = first;
        }

        txn.book.balances.insert(balance_key, obs.raw_value);
        txn.book.claimed.insert(ClaimKey {
            protocol,
            token_id: obs.token_id,
            facet,
            block,
        });
        txn.seen.insert((balance_key, block));
        txn.book.gates.insert(GateKey { protocol, facet }, block);
        txn.advanced.insert((protocol, facet));
        let hw = txn.high_water.entry((protocol, facet)).or_insert(0);
        *hw = (*hw).max(block);
        txn.applied += 1;

        debug!(%protocol, ?facet, block, ?movement, %raw_delta, %usd, "observation applied");
        Ok(())
    }

    async fn to_usd(
        &self,
        normalizer: &dyn PriceNormalizer,
        asset: Address,
        amount: U256,
    ) -> Result<U256, PriceError> {
        if self.registry.is_usd_stable(&asset) {
            return Ok(amount);
        }
        match self.config.price_timeout() {
            Some(deadline) => tokio::time::timeout(deadline, normalizer.price_in_usd(asset, amount))
                .await
                .map_err(|_| PriceError::Timeout(deadline))?,
            None => normalizer.price_in_usd(asset, amount).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::{ReserveRatioNormalizer, StaticReserves};
    use crate::ledger::{ActivityRecord, FacetGates, LedgerConfig};
    use crate::protocol::registry::fixtures::*;
    use crate::protocol::{ShareBasis, TokenId};
    use crate::types::MarketId;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    const OWNER: Address = Address([0x0f; 20]);
    const ALICE: Address = Address([0xa1; 20]);
    const BOB: Address = Address([0xb0; 20]);

    fn weth(n: u64) -> U256 {
        U256::from(n) * U256::exp10(18)
    }

    fn usdc(n: u64) -> U256 {
        U256::from(n) * U256::exp10(6)
    }

    /// 1 WETH = 2000 USDC.
    fn priced() -> Arc<dyn PriceNormalizer> {
        let reserves = StaticReserves::new().with_pool(WETH, weth(1_000), usdc(2_000_000));
        Arc::new(ReserveRatioNormalizer::new(reserves, USDC))
    }

    fn ledger(scope: GateScope) -> Ledger {
        let config = LedgerConfig {
            gate_scope: scope,
            ..Default::default()
        };
        Ledger::new(config, Arc::new(registry()), priced(), OWNER)
    }

    fn aave_debt(user: Address, underlying: Address, balance: U256, block: u64) -> Observation {
        let token = if underlying == USDC { VD_USDC } else { VD_WETH };
        Observation {
            user,
            protocol: Protocol::Aave,
            token_id: TokenId::Aave { token, underlying },
            facet: Facet::Debt,
            block,
            raw_value: balance,
            underlying_asset: underlying,
            share_basis: None,
        }
    }

    fn aave_supply(user: Address, underlying: Address, balance: U256, block: u64) -> Observation {
        let token = if underlying == USDC { A_USDC } else { A_WETH };
        Observation {
            facet: Facet::Collateral,
            token_id: TokenId::Aave { token, underlying },
            ..aave_debt(user, underlying, balance, block)
        }
    }

    fn compound_base(user: Address, balance: U256, block: u64) -> Observation {
        Observation {
            user,
            protocol: Protocol::Compound,
            token_id: TokenId::Compound {
                market: COMET_USDC,
                collateral: None,
            },
            facet: Facet::Debt,
            block,
            raw_value: balance,
            underlying_asset: USDC,
            share_basis: None,
        }
    }

    async fn ingest(l: &Ledger, user: Address, protocol: Protocol, obs: Vec<Observation>) {
        l.ingest_observations(&OWNER, user, protocol, obs)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn borrow_then_repay_deltas() {
        let l = ledger(GateScope::PerUser);
        ingest(&l, ALICE, Protocol::Aave, vec![aave_debt(ALICE, USDC, usdc(1000), 10)]).await;
        ingest(&l, ALICE, Protocol::Aave, vec![aave_debt(ALICE, USDC, usdc(1500), 11)]).await;
        let info = l.user_info(&ALICE, Protocol::Aave);
        assert_eq!(info.borrowed_amount, usdc(1500));
        assert_eq!(info.borrow_times, 2);

        ingest(&l, ALICE, Protocol::Aave, vec![aave_debt(ALICE, USDC, usdc(1200), 12)]).await;
        let info = l.user_info(&ALICE, Protocol::Aave);
        assert_eq!(info.borrowed_amount, usdc(1500));
        assert_eq!(info.repaid_amount, usdc(300));
        assert_eq!(info.repay_times, 1);
        assert_eq!(info.latest_block, 12);
        assert_eq!(info.latest_balance, usdc(1200));
        assert_eq!(info.first_activity_block, 10);
        assert_eq!(l.totals(&ALICE), info);
    }

    #[tokio::test]
    async fn stale_observation_is_skipped() {
        let l = ledger(GateScope::PerUser);
        ingest(&l, ALICE, Protocol::Aave, vec![aave_debt(ALICE, USDC, usdc(10), 1000)]).await;
        let before = l.user_info(&ALICE, Protocol::Aave);
        ingest(&l, ALICE, Protocol::Aave, vec![aave_debt(ALICE, USDC, usdc(99), 999)]).await;
        assert_eq!(l.user_info(&ALICE, Protocol::Aave), before);
        assert!(!l.is_claimed(
            &ALICE,
            Protocol::Aave,
            TokenId::Aave {
                token: VD_USDC,
                underlying: USDC
            },
            Facet::Debt,
            999
        ));
        assert_eq!(
            l.user_facet_gates(&ALICE, Protocol::Aave),
            FacetGates {
                debt: 1000,
                collateral: 0
            }
        );
    }

    #[tokio::test]
    async fn replayed_batch_changes_nothing() {
        let l = ledger(GateScope::PerUser);
        let batch = vec![
            aave_supply(ALICE, USDC, usdc(5000), 20),
            aave_debt(ALICE, USDC, usdc(1000), 20),
        ];
        ingest(&l, ALICE, Protocol::Aave, batch.clone()).await;
        let info = l.user_info(&ALICE, Protocol::Aave);
        let totals = l.totals(&ALICE);
        let gates = l.facet_gates(Protocol::Aave);
        ingest(&l, ALICE, Protocol::Aave, batch).await;
        assert_eq!(l.user_info(&ALICE, Protocol::Aave), info);
        assert_eq!(l.totals(&ALICE), totals);
        assert_eq!(l.facet_gates(Protocol::Aave), gates);
    }

    #[tokio::test]
    async fn same_block_siblings_apply_once_each() {
        let l = ledger(GateScope::PerUser);
        ingest(
            &l,
            ALICE,
            Protocol::Aave,
            vec![
                aave_supply(ALICE, USDC, usdc(100), 30),
                aave_supply(ALICE, WETH, weth(1), 30),
                aave_supply(ALICE, WETH, weth(1), 30),
            ],
        )
        .await;
        let info = l.user_info(&ALICE, Protocol::Aave);
        assert_eq!(info.supplied_amount, usdc(100) + usdc(2000));
        assert_eq!(info.supply_times, 2);
    }

    #[tokio::test]
    async fn repeated_balance_at_one_block_applies_once() {
        let l = ledger(GateScope::PerUser);
        ingest(
            &l,
            ALICE,
            Protocol::Aave,
            vec![
                aave_debt(ALICE, USDC, usdc(2000), 50),
                aave_debt(ALICE, USDC, usdc(0), 50),
                aave_debt(ALICE, USDC, usdc(2000), 50),
                aave_debt(ALICE, USDC, usdc(0), 50),
            ],
        )
        .await;
        let info = l.user_info(&ALICE, Protocol::Aave);
        assert_eq!(info.borrowed_amount, usdc(2000));
        assert_eq!(info.borrow_times, 1);
        assert_eq!(info.repaid_amount, U256::zero());
        assert_eq!(info.repay_times, 0);
        assert_eq!(info.latest_balance, usdc(2000));

        // Another debt token at the same block still applies.
        ingest(
            &l,
            ALICE,
            Protocol::Aave,
            vec![
                aave_debt(ALICE, USDC, usdc(2100), 51),
                aave_debt(ALICE, WETH, weth(1), 51),
                aave_debt(ALICE, USDC, usdc(5), 51),
            ],
        )
        .await;
        let info = l.user_info(&ALICE, Protocol::Aave);
        assert_eq!(info.borrowed_amount, usdc(2000 + 100 + 2000));
        assert_eq!(info.borrow_times, 3);
        assert_eq!(info.repay_times, 0);
    }

    #[tokio::test]
    async fn claims_distinguish_facets() {
        let l = ledger(GateScope::PerUser);
        let market_id = MarketId([0x0c; 32]);
        let debt = Observation {
            user: ALICE,
            protocol: Protocol::Morpho,
            token_id: TokenId::Morpho { market_id },
            facet: Facet::Debt,
            block: 7,
            raw_value: U256::from(10u64),
            underlying_asset: USDC,
            share_basis: Some(ShareBasis {
                total_assets: U256::from(1u64),
                total_shares: U256::from(1u64),
            }),
        };
        ingest(&l, ALICE, Protocol::Morpho, vec![debt]).await;
        let token_id = TokenId::Morpho { market_id };
        assert!(l.is_claimed(&ALICE, Protocol::Morpho, token_id, Facet::Debt, 7));
        assert!(!l.is_claimed(
            &ALICE,
            Protocol::Morpho,
            token_id,
            Facet::Collateral,
            7
        ));
    }

    #[tokio::test]
    async fn collateral_is_a_ratchet() {
        let l = ledger(GateScope::PerUser);
        ingest(&l, ALICE, Protocol::Aave, vec![aave_supply(ALICE, USDC, usdc(1000), 1)]).await;
        ingest(&l, ALICE, Protocol::Aave, vec![aave_supply(ALICE, USDC, usdc(400), 2)]).await;
        let info = l.user_info(&ALICE, Protocol::Aave);
        assert_eq!(info.supplied_amount, usdc(1000));
        assert_eq!(info.supply_times, 1);
        assert_eq!(info.latest_balance, usdc(400));
        ingest(&l, ALICE, Protocol::Aave, vec![aave_supply(ALICE, USDC, usdc(900), 3)]).await;
        let info = l.user_info(&ALICE, Protocol::Aave);
        assert_eq!(info.supplied_amount, usdc(1500));
        assert_eq!(info.supply_times, 2);
    }

    #[tokio::test]
    async fn non_stable_delta_is_priced() {
        let l = ledger(GateScope::PerUser);
        ingest(&l, ALICE, Protocol::Aave, vec![aave_debt(ALICE, WETH, weth(2), 5)]).await;
        assert_eq!(l.user_info(&ALICE, Protocol::Aave).borrowed_amount, usdc(4000));
        ingest(&l, ALICE, Protocol::Aave, vec![aave_debt(ALICE, USDC, usdc(7), 6)]).await;
        assert_eq!(
            l.user_info(&ALICE, Protocol::Aave).borrowed_amount,
            usdc(4007)
        );
    }

    #[tokio::test]
    async fn missing_market_aborts_whole_call() {
        let l = ledger(GateScope::PerUser);
        let dai = Address([0xda; 20]);
        let unpriced = Observation {
            token_id: TokenId::Compound {
                market: COMET_USDC,
                collateral: Some(dai),
            },
            facet: Facet::Collateral,
            underlying_asset: dai,
            ..compound_base(ALICE, usdc(1), 41)
        };
        let err = l
            .ingest_observations(
                &OWNER,
                ALICE,
                Protocol::Compound,
                vec![compound_base(ALICE, usdc(50), 40), unpriced],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Price(PriceError::NoMarket(a)) if a == dai));
        assert_eq!(l.totals(&ALICE), ActivityRecord::default());
        assert_eq!(l.facet_gates(Protocol::Compound), FacetGates::default());
        assert_eq!(
            l.user_facet_gates(&ALICE, Protocol::Compound),
            FacetGates::default()
        );
    }

    #[tokio::test]
    async fn morpho_shares_convert_to_assets() {
        let l = ledger(GateScope::PerUser);
        let market_id = MarketId([0x0b; 32]);
        let obs = |shares: u64, assets: u64, total_shares: u64, block: u64| Observation {
            user: ALICE,
            protocol: Protocol::Morpho,
            token_id: TokenId::Morpho { market_id },
            facet: Facet::Debt,
            block,
            raw_value: U256::from(shares),
            underlying_asset: USDC,
            share_basis: Some(ShareBasis {
                total_assets: U256::from(assets),
                total_shares: U256::from(total_shares),
            }),
        };
        // 2 shares per asset
        ingest(&l, ALICE, Protocol::Morpho, vec![obs(1_000, 500, 1_000, 1)]).await;
        ingest(&l, ALICE, Protocol::Morpho, vec![obs(1_301, 600, 1_200, 2)]).await;
        ingest(&l, ALICE, Protocol::Morpho, vec![obs(1_000, 600, 1_200, 3)]).await;
        let info = l.user_info(&ALICE, Protocol::Morpho);
        // 500 + 301 * 600 / 1200 = 500 + 150
        assert_eq!(info.borrowed_amount, U256::from(650u64));
        assert_eq!(info.repaid_amount, U256::from(150u64));
        assert_eq!(info.latest_balance, U256::from(1_000u64));
    }

    #[tokio::test]
    async fn users_and_protocols_are_isolated() {
        let l = ledger(GateScope::PerUser);
        ingest(&l, BOB, Protocol::Aave, vec![aave_debt(BOB, USDC, usdc(3), 1)]).await;
        ingest(&l, ALICE, Protocol::Compound, vec![compound_base(ALICE, usdc(9), 1)]).await;
        let bob = l.totals(&BOB);
        let alice_compound = l.user_info(&ALICE, Protocol::Compound);

        ingest(&l, ALICE, Protocol::Aave, vec![aave_debt(ALICE, USDC, usdc(100), 2)]).await;
        assert_eq!(l.totals(&BOB), bob);
        assert_eq!(l.user_info(&ALICE, Protocol::Compound), alice_compound);
        assert_eq!(l.totals(&ALICE).borrowed_amount, usdc(109));

        // Observations addressed to someone else are ignored.
        ingest(&l, ALICE, Protocol::Aave, vec![aave_debt(BOB, USDC, usdc(500), 3)]).await;
        assert_eq!(l.totals(&BOB), bob);
        assert_eq!(l.totals(&ALICE).borrowed_amount, usdc(109));
    }

    #[tokio::test]
    async fn totals_aggregate_across_protocols() {
        let l = ledger(GateScope::PerUser);
        ingest(&l, ALICE, Protocol::Compound, vec![compound_base(ALICE, usdc(50), 500)]).await;
        ingest(
            &l,
            ALICE,
            Protocol::Aave,
            vec![
                aave_debt(ALICE, USDC, usdc(70), 300),
                aave_supply(ALICE, USDC, usdc(200), 310),
            ],
        )
        .await;
        ingest(&l, ALICE, Protocol::Aave, vec![aave_debt(ALICE, USDC, usdc(20), 320)]).await;

        let t = l.totals(&ALICE);
        let per: Vec<_> = Protocol::ALL
            .iter()
            .map(|p| l.user_info(&ALICE, *p))
            .collect();
        let sum = |f: fn(&ActivityRecord) -> U256| per.iter().fold(U256::zero(), |a, r| a + f(r));
        assert_eq!(t.borrowed_amount, sum(|r| r.borrowed_amount));
        assert_eq!(t.supplied_amount, sum(|r| r.supplied_amount));
        assert_eq!(t.repaid_amount, sum(|r| r.repaid_amount));
        assert_eq!(t.borrow_times, per.iter().map(|r| r.borrow_times).sum::<u64>());
        assert_eq!(t.supply_times, per.iter().map(|r| r.supply_times).sum::<u64>());
        assert_eq!(t.repay_times, per.iter().map(|r| r.repay_times).sum::<u64>());
        assert_eq!(t.latest_block, 500);
        assert_eq!(t.first_activity_block, 300);
    }

    #[tokio::test]
    async fn global_gate_couples_users() {
        let l = ledger(GateScope::Global);
        ingest(&l, ALICE, Protocol::Aave, vec![aave_debt(ALICE, USDC, usdc(1), 1000)]).await;
        ingest(&l, BOB, Protocol::Aave, vec![aave_debt(BOB, USDC, usdc(1), 999)]).await;
        assert_eq!(l.totals(&BOB), ActivityRecord::default());
        assert_eq!(l.user_facet_gates(&BOB, Protocol::Aave).debt, 1000);
        // Other facets and protocols are unaffected.
        ingest(&l, BOB, Protocol::Aave, vec![aave_supply(BOB, USDC, usdc(1), 999)]).await;
        ingest(&l, BOB, Protocol::Compound, vec![compound_base(BOB, usdc(1), 5)]).await;
        assert_eq!(l.totals(&BOB).supply_times, 1);
        assert_eq!(l.totals(&BOB).borrow_times, 1);
    }

    #[tokio::test]
    async fn per_user_gate_keeps_users_independent() {
        let l = ledger(GateScope::PerUser);
        ingest(&l, ALICE, Protocol::Aave, vec![aave_debt(ALICE, USDC, usdc(1), 1000)]).await;
        ingest(&l, BOB, Protocol::Aave, vec![aave_debt(BOB, USDC, usdc(1), 999)]).await;
        assert_eq!(l.totals(&BOB).borrow_times, 1);
        assert_eq!(l.facet_gates(Protocol::Aave).debt, 1000);
        assert_eq!(l.user_facet_gates(&BOB, Protocol::Aave).debt, 999);
    }

    #[tokio::test]
    async fn untrusted_caller_is_rejected() {
        let l = ledger(GateScope::PerUser);
        let err = l
            .ingest_observations(
                &BOB,
                ALICE,
                Protocol::Aave,
                vec![aave_debt(ALICE, USDC, usdc(1), 1)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Unauthorized(c) if c == BOB));
        assert!(matches!(
            l.set_trusted_caller(&BOB, BOB),
            Err(LedgerError::NotOwner(_))
        ));
        assert_eq!(l.trusted_caller(), OWNER);
        l.set_trusted_caller(&OWNER, BOB).unwrap();
        assert_eq!(l.trusted_caller(), BOB);
        l.ingest_observations(
            &BOB,
            ALICE,
            Protocol::Aave,
            vec![aave_debt(ALICE, USDC, usdc(1), 1)],
        )
        .await
        .unwrap();
        assert!(l
            .ingest_observations(&OWNER, ALICE, Protocol::Aave, vec![])
            .await
            .is_err());

        l.transfer_ownership(&OWNER, ALICE).unwrap();
        assert_eq!(l.owner(), ALICE);
        assert!(l.set_price_normalizer(&OWNER, priced()).is_err());
        l.set_price_normalizer(&ALICE, priced()).unwrap();
    }

    struct Stalled;

    #[async_trait]
    impl PriceNormalizer for Stalled {
        async fn price_in_usd(&self, _asset: Address, amount: U256) -> Result<U256, PriceError> {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok(amount)
        }
    }

    #[tokio::test]
    async fn price_lookup_deadline() {
        let config = LedgerConfig {
            price_timeout_ms: Some(20),
            ..Default::default()
        };
        let l = Ledger::new(config, Arc::new(registry()), Arc::new(Stalled), OWNER);
        let err = l
            .ingest_observations(
                &OWNER,
                ALICE,
                Protocol::Aave,
                vec![aave_debt(ALICE, WETH, weth(1), 1)],
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Price(PriceError::Timeout(_))));
        // Stable assets never reach the normalizer.
        ingest(&l, ALICE, Protocol::Aave, vec![aave_debt(ALICE, USDC, usdc(1), 1)]).await;
        assert_eq!(l.totals(&ALICE).borrowed_amount, usdc(1));
    }

    #[tokio::test]
    async fn liquidations_drive_score() {
        let l = ledger(GateScope::PerUser);
        ingest(&l, ALICE, Protocol::Aave, vec![aave_supply(ALICE, USDC, usdc(10), 100)]).await;
        assert!(l.score(&ALICE, 100).score > 10);
        l.set_liquidations(&OWNER, ALICE, Protocol::Morpho, 1)
            .await
            .unwrap();
        assert_eq!(l.totals(&ALICE).liquidations, 1);
        assert_eq!(l.score(&ALICE, 100).score, 10);
        assert!(l.score_per_protocol(&ALICE, Protocol::Aave, 100).score > 10);
        assert!(l
            .set_liquidations(&BOB, ALICE, Protocol::Aave, 1)
            .await
            .is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_ingests_serialize_per_user() {
        let l = Arc::new(ledger(GateScope::PerUser));
        let mut handles = Vec::new();
        for (i, user) in [ALICE, BOB].into_iter().enumerate() {
            for step in 1..=20u64 {
                let l = l.clone();
                let protocol = if i == 0 { Protocol::Aave } else { Protocol::Compound };
                handles.push(tokio::spawn(async move {
                    let obs = match protocol {
                        Protocol::Aave => aave_supply(user, USDC, usdc(step), step),
                        _ => compound_base(user, usdc(step), step),
                    };
                    l.ingest_observations(&OWNER, user, protocol, vec![obs])
                        .await
                        .unwrap();
                }));
            }
        }
        for h in handles {
            h.await.unwrap();
        }
        for user in [ALICE, BOB] {
            let t = l.totals(&user);
            // Accepted balances form an increasing run ending at block 20.
            assert_eq!(t.supplied_amount + t.borrowed_amount, usdc(20));
            assert_eq!(t.latest_block, 20);
        }
    }
}
