use super::state::{ConnectOptions, SessionContext};
use crate::codec::{IsoCodec, IsoFrame};
use crate::error::{Error, Result};
use crate::frame::{CommSetup, Cotp, S7Pdu, WireDecode};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tracing::debug;

/// COTP CR/CC exchange on a connected framed transport.
pub(super) async fn open_transport<S>(
    framed: &mut Framed<S, IsoCodec>,
    options: &ConnectOptions,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let cr = Cotp::connect_request(
        options.pdu_size,
        options.connection_type,
        options.rack,
        options.slot,
    );
    timeout(options.receive_timeout(), framed.send(IsoFrame::control(cr)))
        .await
        .map_err(|_| Error::Timeout { pdu_ref: None })?
        .map_err(Error::Transport)?;

    let frame = timeout(options.receive_timeout(), framed.next())
        .await
        .map_err(|_| Error::Timeout { pdu_ref: None })?
        .ok_or(Error::NotConnected)?
        .map_err(Error::Transport)?;
    match frame.cotp {
        Cotp::Cc(params) => {
            debug!(tpdu_size = params.tpdu_size, "transport association confirmed");
            Ok(())
        }
        _ => Err(Error::UnexpectedPdu),
    }
}

/// COMM-SETUP negotiation; the acknowledged values are authoritative.
pub(super) async fn negotiate<S>(
    framed: &mut Framed<S, IsoCodec>,
    options: &ConnectOptions,
    pdu_ref: u16,
) -> Result<SessionContext>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = CommSetup {
        max_am_q_calling: options.max_parallel_jobs,
        max_am_q_called: options.max_parallel_jobs,
        pdu_size: options.pdu_size,
    };
    timeout(
        options.receive_timeout(),
        framed.send(IsoFrame::data(request.build_job(pdu_ref))),
    )
    .await
    .map_err(|_| Error::Timeout {
        pdu_ref: Some(pdu_ref),
    })?
    .map_err(Error::Transport)?;

    let frame = timeout(options.receive_timeout(), framed.next())
        .await
        .map_err(|_| Error::Timeout {
            pdu_ref: Some(pdu_ref),
        })?
        .ok_or(Error::NotConnected)?
        .map_err(Error::Transport)?;
    if !matches!(frame.cotp, Cotp::D(_)) {
        return Err(Error::UnexpectedPdu);
    }
    let (_, pdu) = S7Pdu::parse(&frame.payload, &frame.payload, &())?;
    pdu.validate_response()?;
    let granted = CommSetup::parse_param(&pdu.param)?;
    if granted.pdu_size == 0 || granted.max_am_q_calling == 0 {
        return Err(Error::Decode {
            context: "peer granted zero pdu size or job credit",
        });
    }
    debug!(
        pdu_size = granted.pdu_size,
        calling = granted.max_am_q_calling,
        called = granted.max_am_q_called,
        "session parameters negotiated"
    );
    Ok(SessionContext {
        timeout: options.receive_timeout(),
        pdu_size: granted.pdu_size,
        max_am_q_calling: granted.max_am_q_calling,
        max_am_q_called: granted.max_am_q_called,
    })
}
