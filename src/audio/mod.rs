pub mod output;
pub mod pcm;
pub mod playback;
pub mod text;
