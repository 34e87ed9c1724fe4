use crate::api::orders::{BrokerOrder, OrderRequest};
use crate::execution::{OptionPosition, PositionStatus};
use crate::models::{Direction, ExitReason, OptionType};
use crate::Result;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use uuid::Uuid;

const POSITION_COLUMNS: &str = r#"
    id, symbol, underlying, option_type, quantity, entry_price, entry_underlying,
    entry_time, current_price, stop_level, highest_price, lowest_price, pnl,
    order_id, stop_order_id, status, exit_price, exit_time, exit_reason, updated_at
"#;

/// Postgres persistence for option positions and submitted orders
pub struct PostgresPersistence {
    pool: PgPool,
}

fn option_type_str(option_type: OptionType) -> &'static str {
    match option_type {
        OptionType::Call => "call",
        OptionType::Put => "put",
    }
}

fn parse_option_type(value: &str) -> Result<OptionType> {
    match value {
        "call" => Ok(OptionType::Call),
        "put" => Ok(OptionType::Put),
        other => Err(format!("Invalid option type '{}'", other).into()),
    }
}

fn parse_status(value: &str) -> Result<PositionStatus> {
    match value {
        "open" => Ok(PositionStatus::Open),
        "closed" => Ok(PositionStatus::Closed),
        other => Err(format!("Invalid position status '{}'", other).into()),
    }
}

fn to_f64(value: Decimal) -> Result<f64> {
    Ok(value.to_string().parse()?)
}

fn parse_price(value: Option<&str>) -> Option<f64> {
    value.and_then(|v| v.parse::<f64>().ok())
}

fn row_to_position(row: &PgRow) -> Result<OptionPosition> {
    let option_type = parse_option_type(row.get::<String, _>("option_type").as_str())?;
    let status = parse_status(row.get::<String, _>("status").as_str())?;

    let exit_reason = match row.get::<Option<String>, _>("exit_reason") {
        Some(value) => Some(
            ExitReason::parse(&value).ok_or_else(|| format!("Invalid exit reason '{}'", value))?,
        ),
        None => None,
    };

    let quantity: i32 = row.get("quantity");
    let exit_price: Option<Decimal> = row.get("exit_price");

    Ok(OptionPosition {
        id: row.get("id"),
        symbol: row.get("symbol"),
        underlying: row.get("underlying"),
        direction: match option_type {
            OptionType::Call => Direction::Bullish,
            OptionType::Put => Direction::Bearish,
        },
        option_type,
        quantity: u32::try_from(quantity)?,
        entry_price: to_f64(row.get("entry_price"))?,
        entry_underlying: to_f64(row.get("entry_underlying"))?,
        entry_time: row.get("entry_time"),
        current_price: to_f64(row.get("current_price"))?,
        stop_level: to_f64(row.get("stop_level"))?,
        highest_price: to_f64(row.get("highest_price"))?,
        lowest_price: to_f64(row.get("lowest_price"))?,
        pnl: to_f64(row.get("pnl"))?,
        order_id: row.get("order_id"),
        stop_order_id: row.get("stop_order_id"),
        status,
        exit_price: exit_price.map(to_f64).transpose()?,
        exit_time: row.get("exit_time"),
        exit_reason,
        last_update: row.get::<DateTime<Utc>, _>("updated_at"),
    })
}

impl PostgresPersistence {
    /// Connect to Postgres and run pending migrations
    ///
    /// # Arguments
    /// * `database_url` - Postgres connection URL
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;

        // Run migrations
        sqlx::migrate!("./migrations").run(&pool).await?;

        tracing::info!("Connected to Postgres at {}", database_url);

        Ok(Self { pool })
    }

    /// Insert or update a position keyed by its id
    pub async fn save_position(&self, position: &OptionPosition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO option_positions (
                id, symbol, underlying, option_type, quantity, entry_price,
                entry_underlying, entry_time, current_price, stop_level,
                highest_price, lowest_price, pnl, order_id, stop_order_id,
                status, exit_price, exit_time, exit_reason
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            ON CONFLICT (id) DO UPDATE SET
                current_price = EXCLUDED.current_price,
                stop_level = EXCLUDED.stop_level,
                highest_price = EXCLUDED.highest_price,
                lowest_price = EXCLUDED.lowest_price,
                pnl = EXCLUDED.pnl,
                stop_order_id = EXCLUDED.stop_order_id,
                status = EXCLUDED.status,
                exit_price = EXCLUDED.exit_price,
                exit_time = EXCLUDED.exit_time,
                exit_reason = EXCLUDED.exit_reason,
                updated_at = NOW()
            "#,
        )
        .bind(position.id)
        .bind(&position.symbol)
        .bind(&position.underlying)
        .bind(option_type_str(position.option_type))
        .bind(position.quantity as i32)
        .bind(position.entry_price)
        .bind(position.entry_underlying)
        .bind(position.entry_time)
        .bind(position.current_price)
        .bind(position.stop_level)
        .bind(position.highest_price)
        .bind(position.lowest_price)
        .bind(position.pnl)
        .bind(&position.order_id)
        .bind(&position.stop_order_id)
        .bind(position.status.as_str())
        .bind(position.exit_price)
        .bind(position.exit_time)
        .bind(position.exit_reason.map(|r| r.as_str()))
        .execute(&self.pool)
        .await?;

        tracing::debug!(
            "Saved position {} for {} to Postgres",
            position.id,
            position.symbol
        );

        Ok(())
    }

    /// Load every stored position, oldest entry first
    pub async fn load_positions(&self) -> Result<Vec<OptionPosition>> {
        let query = format!(
            "SELECT {} FROM option_positions ORDER BY entry_time ASC",
            POSITION_COLUMNS
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let positions = rows
            .iter()
            .map(row_to_position)
            .collect::<Result<Vec<_>>>()?;

        tracing::info!("Loaded {} positions from Postgres", positions.len());
        Ok(positions)
    }

    /// Positions still open, used to restore state at start
    pub async fn load_open_positions(&self) -> Result<Vec<OptionPosition>> {
        let query = format!(
            "SELECT {} FROM option_positions WHERE status = 'open' ORDER BY entry_time ASC",
            POSITION_COLUMNS
        );
        let rows = sqlx::query(&query).fetch_all(&self.pool).await?;

        let positions = rows
            .iter()
            .map(row_to_position)
            .collect::<Result<Vec<_>>>()?;

        tracing::info!("Loaded {} open positions from Postgres", positions.len());
        Ok(positions)
    }

    /// Append a submitted order to the order log
    pub async fn log_order(&self, order: &OrderRequest, placed: &BrokerOrder) -> Result<()> {
        let leg = order
            .legs
            .first()
            .ok_or("Cannot log an order without legs")?;

        sqlx::query(
            r#"
            INSERT INTO orders (
                broker_order_id, symbol, action, order_type, quantity,
                price, stop_trigger, status
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(&placed.id)
        .bind(&leg.symbol)
        .bind(format!("{:?}", leg.action))
        .bind(format!("{:?}", order.order_type))
        .bind(leg.quantity as i32)
        .bind(parse_price(order.price.as_deref()))
        .bind(parse_price(order.stop_trigger.as_deref()))
        .bind(&placed.status)
        .execute(&self.pool)
        .await?;

        tracing::debug!("Logged order {} for {}", placed.id, leg.symbol);
        Ok(())
    }

    /// Total realized P&L over closed positions
    pub async fn get_total_pnl(&self) -> Result<f64> {
        let row = sqlx::query(
            r#"
            SELECT COALESCE(SUM(pnl), 0) as total_pnl
            FROM option_positions
            WHERE status = 'closed'
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let total_pnl: Decimal = row.get("total_pnl");
        to_f64(total_pnl)
    }

    /// Delete all positions and orders (testing only)
    #[cfg(test)]
    pub async fn clear_all(&self) -> Result<()> {
        sqlx::query("DELETE FROM option_positions")
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM orders").execute(&self.pool).await?;
        Ok(())
    }
}
