use thiserror::Error;

#[derive(Debug, Error)]
pub enum TncError {
    #[error("sound card init aborted unexpectedly")]
    SoundcardInit,

    #[error("unable to locate sound card '{0}' - is it in use?")]
    SoundcardNotFound(String),

    #[error("could not find a suitable soundcard config")]
    NoValidConfigAvailable,

    #[error("unable to build soundcard stream: {0}")]
    StreamBuild(#[source] cpal::BuildStreamError),

    #[error("unable to play soundcard stream: {0}")]
    StreamPlay(#[source] cpal::PlayStreamError),

    #[error("unable to open PTT serial port: {0}")]
    PttPort(#[from] serialport::Error),

    #[error("channel {0} is not configured")]
    ChannelOutOfRange(usize),

    #[error("client supplied bytes that do not form a valid AX.25 frame")]
    InvalidFrame,

    #[error("transmit queue is closed")]
    QueueClosed,
}
