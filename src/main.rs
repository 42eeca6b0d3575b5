use credit_engine::{
    Address, ClosePath, Config, CreditManagerParams, CreditSystem, Decimal, FixedRateRouter,
    FungibleAsset, PriceFeed, StaticPriceFeed, SystemClock, TokenId,
};
use std::sync::Arc;

fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries the event log.
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing_subscriber::filter::LevelFilter::INFO.into()),
        )
        .init();

    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let mut system = CreditSystem::new(&config, Arc::new(SystemClock))?;
    run_session(&mut system, &config)?;

    for record in system.events() {
        println!("{}", serde_json::to_string(record)?);
    }
    Ok(())
}

fn units(n: u64) -> Decimal {
    Decimal::from_units(n)
}

/// Deposit, open a leveraged position, trade into collateral and close it.
fn run_session(system: &mut CreditSystem, config: &Config) -> anyhow::Result<()> {
    let now = system.now();
    let underlying = config.underlying_token.clone();
    let collateral = TokenId::new("LINK");

    let feeds: Vec<Arc<dyn PriceFeed>> = vec![
        Arc::new(StaticPriceFeed::new(Decimal::one(), now)),
        Arc::new(StaticPriceFeed::new(units(2), now)),
    ];
    system.add_price_feed(&[underlying.clone(), collateral.clone()], feeds)?;

    let router = Arc::new(FixedRateRouter::new(Address::derive("router", b"session"), 30));
    router.set_rate(&collateral, &underlying, units(2));
    let router_address = system.add_router(router);
    for token in [&underlying, &collateral] {
        system
            .ledger_mut()
            .mint(&router_address, token, &router_address, units(10_000_000))?;
    }

    let manager = system.add_credit_manager(CreditManagerParams {
        default_router: Some(router_address.clone()),
        ..config.credit_manager.clone()
    })?;
    system.allow_token(&manager, &collateral, 8_500)?;

    let lp = Address::new("0xsession-lp");
    let trader = Address::new("0xsession-trader");
    let pool = system.pool().address().clone();
    {
        let ledger = system.ledger_mut();
        ledger.mint(&lp, &underlying, &lp, units(1_000_000))?;
        ledger.approve(&underlying, &lp, &pool, Decimal::MAX)?;
        ledger.mint(&trader, &underlying, &trader, units(10_000))?;
        ledger.approve(&underlying, &trader, &manager, Decimal::MAX)?;
    }
    system.add_liquidity(&lp, units(500_000), &lp, 0)?;

    system.open_credit_account(&manager, &trader, units(1_000), &trader, 300, 0)?;
    let received = system.execute_order(
        &manager,
        &trader,
        &router_address,
        units(2_000),
        Decimal::zero(),
        &[underlying.clone(), collateral.clone()],
    )?;
    let health_factor = system.calc_credit_account_health_factor(&manager, &trader)?;
    tracing::info!(%received, health_factor, "position built");

    let paths = vec![
        ClosePath::skip(),
        ClosePath::new(vec![collateral, underlying], Decimal::zero()),
    ];
    let remaining = system.close_credit_account(&manager, &trader, &trader, &paths)?;
    tracing::info!(%remaining, "position closed");

    let returned = system.remove_liquidity(&lp, units(100_000), &lp)?;
    tracing::info!(
        %returned,
        expected_liquidity = %system.expected_liquidity(),
        share_rate = %system.share_rate(),
        "session finished"
    );
    Ok(())
}
