//! Scoped transactions over a shared [`Connection`].
//!
//! `tokio_postgres::Transaction` needs `&mut Client`, which a pooled or
//! borrowed connection can't always hand out. These helpers drive the
//! transaction with plain `BEGIN`/`COMMIT`/`ROLLBACK` instead.
//!
//! With a shared connection nothing stops the work inside from sending its
//! own `COMMIT`. After that, `ROLLBACK` only draws a server warning. So the
//! transaction id is taken right after `BEGIN` and checked again before the
//! transaction is finished.

use tokio_postgres::error::SqlState;

use crate::{Connection, ConnectionExt, Error, Result};

/// Run `f` inside a transaction: commit when it returns `Ok`, roll back when
/// it returns `Err`.
///
/// A failed `ROLLBACK` is logged and the original error returned, since it's
/// the one the caller can act on.
pub async fn transaction<C, T>(conn: &C, f: impl AsyncFnOnce(&C) -> Result<T>) -> Result<T>
where
    C: Connection + ?Sized,
{
    let txid = begin(conn).await?;

    let value = match f(conn).await {
        Ok(value) => value,
        Err(err) => {
            rollback_quietly(conn).await;
            return Err(err);
        }
    };
    if let Err(err) = ensure_open(conn, txid).await {
        rollback_quietly(conn).await;
        return Err(err);
    }
    conn.traced().batch_execute("COMMIT").await?;
    Ok(value)
}

/// Run `f` inside a transaction that is always rolled back.
///
/// `f` can't fail from the transaction's point of view: anything it wants to
/// report goes into its return value. The errors here are failing to `BEGIN`
/// or `ROLLBACK`, and [`Error::TransactionClosed`] when `f` ended the
/// transaction itself.
pub async fn rolled_back<C, T>(conn: &C, f: impl AsyncFnOnce(&C) -> T) -> Result<T>
where
    C: Connection + ?Sized,
{
    let txid = begin(conn).await?;
    let value = f(conn).await;
    let open = ensure_open(conn, txid).await;
    conn.traced().batch_execute("ROLLBACK").await?;
    open?;
    Ok(value)
}

/// `BEGIN`, then force a transaction id so the transaction can be told
/// apart from whatever runs after it.
async fn begin<C: Connection + ?Sized>(conn: &C) -> Result<i64> {
    conn.traced().batch_execute("BEGIN").await?;
    match conn.traced().query_one("SELECT txid_current()", &[]).await {
        Ok(row) => Ok(row.try_get(0)?),
        Err(err) => {
            rollback_quietly(conn).await;
            Err(err.into())
        }
    }
}

/// Check that transaction `txid` is still the one in progress.
async fn ensure_open<C: Connection + ?Sized>(conn: &C, txid: i64) -> Result<()> {
    match conn
        .traced()
        .query_one("SELECT txid_current_if_assigned()", &[])
        .await
    {
        Ok(row) => {
            let current: Option<i64> = row.try_get(0)?;
            if current == Some(txid) {
                Ok(())
            } else {
                tracing::error!(txid, ?current, "transaction ended early");
                Err(Error::TransactionClosed { txid })
            }
        }
        // Aborted by a failed statement: still open, waiting for ROLLBACK.
        Err(err) if err.code() == Some(&SqlState::IN_FAILED_SQL_TRANSACTION) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

async fn rollback_quietly<C: Connection + ?Sized>(conn: &C) {
    if let Err(rollback_err) = conn.traced().batch_execute("ROLLBACK").await {
        tracing::warn!(error = %rollback_err, "rollback after failure also failed");
    }
}
